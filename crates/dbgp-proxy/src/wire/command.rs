//! Parses the one-line textual commands sent by the IDE-side listener:
//! `proxyinit`, `proxystop`, `cloudinit`, `cloudstop`.

use crate::errors::CommandError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ProxyInit {
        ide_key: String,
        port: u16,
        multiple: bool,
        ssl: bool,
    },
    ProxyStop {
        ide_key: String,
    },
    CloudInit {
        user_id: String,
    },
    CloudStop {
        user_id: String,
    },
}

const DEFAULT_PROXY_PORT: u16 = 9003;

/// Parses a single decoded command line (NUL already stripped).
pub fn parse(line: &str) -> Result<Command, CommandError> {
    let mut tokens = line.split_whitespace();
    let verb = tokens.next().ok_or(CommandError::Empty)?;
    let flags = parse_flags(tokens)?;

    match verb {
        "proxyinit" => build_proxy_init(flags),
        "proxystop" => build_proxy_stop(flags),
        "cloudinit" => build_cloud_init(flags),
        "cloudstop" => build_cloud_stop(flags),
        other => Err(CommandError::UnknownVerb(other.to_string())),
    }
}

fn parse_flags<'a>(
    mut tokens: impl Iterator<Item = &'a str>,
) -> Result<Vec<(char, String)>, CommandError> {
    let mut flags = Vec::new();
    while let Some(token) = tokens.next() {
        let flag = token
            .strip_prefix('-')
            .and_then(|f| f.chars().next())
            .ok_or_else(|| CommandError::UnknownArgument {
                flag: token.chars().next().unwrap_or('?'),
                value: String::new(),
            })?;
        let value = tokens
            .next()
            .ok_or(CommandError::MissingValue(flag))?
            .to_string();
        flags.push((flag, value));
    }
    Ok(flags)
}

fn find<'a>(flags: &'a [(char, String)], c: char) -> Option<&'a str> {
    flags
        .iter()
        .find(|(flag, _)| *flag == c)
        .map(|(_, v)| v.as_str())
}

/// Rejects any flag not in `allowed`: `-i` (transaction id) is accepted and
/// ignored by every verb, matching the original command parsers.
fn reject_unknown(flags: &[(char, String)], allowed: &[char]) -> Result<(), CommandError> {
    for (flag, value) in flags {
        if *flag != 'i' && !allowed.contains(flag) {
            return Err(CommandError::UnknownArgument {
                flag: *flag,
                value: value.clone(),
            });
        }
    }
    Ok(())
}

fn build_proxy_init(flags: Vec<(char, String)>) -> Result<Command, CommandError> {
    reject_unknown(&flags, &['p', 'k', 'm', 's'])?;
    let ide_key = find(&flags, 'k')
        .ok_or(CommandError::MissingIdeKey)?
        .to_string();
    let port = match find(&flags, 'p') {
        Some(v) => v.parse().map_err(|_| CommandError::InvalidNumber {
            flag: 'p',
            value: v.to_string(),
        })?,
        None => DEFAULT_PROXY_PORT,
    };
    let multiple = find(&flags, 'm') == Some("1");
    let ssl = match find(&flags, 's') {
        Some("1") => true,
        Some(v) if v != "0" => {
            return Err(CommandError::InvalidNumber {
                flag: 's',
                value: v.to_string(),
            })
        }
        _ => false,
    };
    Ok(Command::ProxyInit {
        ide_key,
        port,
        multiple,
        ssl,
    })
}

fn build_proxy_stop(flags: Vec<(char, String)>) -> Result<Command, CommandError> {
    reject_unknown(&flags, &['k'])?;
    let ide_key = find(&flags, 'k')
        .ok_or(CommandError::MissingIdeKey)?
        .to_string();
    Ok(Command::ProxyStop { ide_key })
}

fn build_cloud_init(flags: Vec<(char, String)>) -> Result<Command, CommandError> {
    reject_unknown(&flags, &['u'])?;
    let user_id = find(&flags, 'u')
        .ok_or(CommandError::MissingUserId)?
        .to_string();
    Ok(Command::CloudInit { user_id })
}

fn build_cloud_stop(flags: Vec<(char, String)>) -> Result<Command, CommandError> {
    reject_unknown(&flags, &['u'])?;
    let user_id = find(&flags, 'u')
        .ok_or(CommandError::MissingUserId)?
        .to_string();
    Ok(Command::CloudStop { user_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proxyinit_with_all_flags() {
        let cmd = parse("proxyinit -i 1 -k KEY1 -p 9000 -m 1 -s 1").unwrap();
        assert_eq!(
            cmd,
            Command::ProxyInit {
                ide_key: "KEY1".into(),
                port: 9000,
                multiple: true,
                ssl: true,
            }
        );
    }

    #[test]
    fn proxyinit_defaults_port_when_absent() {
        let cmd = parse("proxyinit -i 1 -k KEY1").unwrap();
        assert_eq!(
            cmd,
            Command::ProxyInit {
                ide_key: "KEY1".into(),
                port: DEFAULT_PROXY_PORT,
                multiple: false,
                ssl: false,
            }
        );
    }

    #[test]
    fn proxyinit_without_key_is_an_error() {
        let err = parse("proxyinit -i 1").unwrap_err();
        assert!(matches!(err, CommandError::MissingIdeKey));
    }

    #[test]
    fn cloudinit_requires_user() {
        let err = parse("cloudinit -i 1").unwrap_err();
        assert!(matches!(err, CommandError::MissingUserId));
        let cmd = parse("cloudinit -i 1 -u USER").unwrap();
        assert_eq!(
            cmd,
            Command::CloudInit {
                user_id: "USER".into()
            }
        );
    }

    #[test]
    fn unknown_verb_is_an_error() {
        let err = parse("frobnicate -k x").unwrap_err();
        assert!(matches!(err, CommandError::UnknownVerb(v) if v == "frobnicate"));
    }

    #[test]
    fn orphan_flag_is_an_error() {
        let err = parse("proxyinit -k").unwrap_err();
        assert!(matches!(err, CommandError::MissingValue('k')));
    }

    #[test]
    fn empty_line_is_an_error() {
        let err = parse("").unwrap_err();
        assert!(matches!(err, CommandError::Empty));
    }

    #[test]
    fn proxyinit_rejects_unknown_flag() {
        let err = parse("proxyinit -i 1 -k KEY1 -z foo").unwrap_err();
        assert!(matches!(
            err,
            CommandError::UnknownArgument { flag: 'z', value } if value == "foo"
        ));
    }

    #[test]
    fn proxystop_rejects_flags_outside_its_own_set() {
        let err = parse("proxystop -k KEY1 -p 9000").unwrap_err();
        assert!(matches!(
            err,
            CommandError::UnknownArgument { flag: 'p', value } if value == "9000"
        ));
    }

    #[test]
    fn cloudinit_rejects_unknown_flag() {
        let err = parse("cloudinit -u USER -k KEY1").unwrap_err();
        assert!(matches!(
            err,
            CommandError::UnknownArgument { flag: 'k', value } if value == "KEY1"
        ));
    }
}
