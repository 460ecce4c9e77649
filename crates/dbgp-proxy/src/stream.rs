//! A boxed, object-safe stream type so the splice engine can treat a plain
//! `TcpStream` and a `TlsStream<TcpStream>` uniformly.

use tokio::io::{AsyncRead, AsyncWrite};

pub trait AsyncDuplex: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplex for T {}

pub type BoxedStream = Box<dyn AsyncDuplex>;
