//! Executes parsed commands against a registry and produces the matching
//! reply document. One handler per verb, colocated per route.

use crate::registry::{EndpointKind, Registry};
use crate::wire::command::Command;
use crate::wire::xml::{CloudInit, CloudStop, ProxyInit, ProxyStop};

/// Handles a command read from the IDE-side listener. `remote_ip` is the
/// source address of the connection that sent the command; `registries`
/// bundles the proxy registry (used by `proxyinit`/`proxystop`) with the
/// cloud registry (used by `cloudinit`/`cloudstop`).
pub fn handle(command: Command, remote_ip: &str, proxy: &Registry, cloud: &Registry) -> String {
    match command {
        Command::ProxyInit {
            ide_key,
            port,
            ssl,
            multiple: _,
        } => proxy_init(proxy, &ide_key, remote_ip, port, ssl),
        Command::ProxyStop { ide_key } => proxy_stop(proxy, &ide_key),
        Command::CloudInit { user_id } => cloud_init(cloud, &user_id),
        Command::CloudStop { user_id } => cloud_stop(cloud, &user_id),
    }
}

fn proxy_init(registry: &Registry, ide_key: &str, remote_ip: &str, port: u16, ssl: bool) -> String {
    match registry.add(
        ide_key,
        remote_ip.to_string(),
        port,
        ssl,
        EndpointKind::ProxyRegistered,
    ) {
        Ok(info) => {
            tracing::info!(verb = "proxyinit", key = %ide_key, host = %info.host, port, "registered IDE");
            ProxyInit::success(ide_key, &info.host, info.port)
                .to_xml()
                .expect("serialising proxyinit reply")
        }
        Err(err) => {
            tracing::warn!(verb = "proxyinit", key = %ide_key, error = %err, "registration failed");
            ProxyInit::failure(ide_key, err.to_string())
                .to_xml()
                .expect("serialising proxyinit reply")
        }
    }
}

fn proxy_stop(registry: &Registry, ide_key: &str) -> String {
    match registry.remove(ide_key) {
        Ok(()) => {
            tracing::info!(verb = "proxystop", key = %ide_key, "unregistered IDE");
            ProxyStop::success(ide_key)
                .to_xml()
                .expect("serialising proxystop reply")
        }
        Err(err) => {
            tracing::warn!(verb = "proxystop", key = %ide_key, error = %err, "unregistration failed");
            ProxyStop::failure(ide_key, err.to_string())
                .to_xml()
                .expect("serialising proxystop reply")
        }
    }
}

fn cloud_init(registry: &Registry, user_id: &str) -> String {
    match registry.add(user_id, String::new(), 0, true, EndpointKind::CloudMultiplexed) {
        Ok(_) => {
            tracing::info!(verb = "cloudinit", user = %user_id, "registered cloud session");
            CloudInit::success(user_id)
                .to_xml()
                .expect("serialising cloudinit reply")
        }
        Err(err) => {
            tracing::warn!(verb = "cloudinit", user = %user_id, error = %err, "cloud registration failed");
            CloudInit::failure(user_id, err.to_string())
                .to_xml()
                .expect("serialising cloudinit reply")
        }
    }
}

fn cloud_stop(registry: &Registry, user_id: &str) -> String {
    match registry.remove(user_id) {
        Ok(()) => {
            tracing::info!(verb = "cloudstop", user = %user_id, "unregistered cloud session");
            CloudStop::success(user_id)
                .to_xml()
                .expect("serialising cloudstop reply")
        }
        Err(err) => {
            tracing::warn!(verb = "cloudstop", user = %user_id, error = %err, "cloud unregistration failed");
            CloudStop::failure(user_id, err.to_string())
                .to_xml()
                .expect("serialising cloudstop reply")
        }
    }
}
