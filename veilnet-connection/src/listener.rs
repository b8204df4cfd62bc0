//! A thin accept-loop convenience, mirroring the shape of the teacher's
//! `connection::address` module (there, an `AbstractAddress` wrapping a
//! tokio listener) without the async runtime: `Connection` itself never
//! owns a listener, so a caller that wants one gets this instead of
//! hand-rolling `TcpListener::bind`/`accept`/`Connection::wrap` at every
//! call site.

use std::net::{TcpListener, ToSocketAddrs};
use std::sync::Arc;

use crate::collab::{Dispatcher, Logger};
use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionError};

pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> std::io::Result<Self> {
        Ok(Listener { inner: TcpListener::bind(addr)? })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts the next inbound socket and runs the responder side of the
    /// full handshake on it before returning.
    pub fn accept(
        &self,
        config: ConnectionConfig,
        logger: Option<Arc<dyn Logger>>,
        dispatcher: Option<Arc<dyn Dispatcher>>,
    ) -> Result<Arc<Connection>, ConnectionError> {
        let (socket, _peer) = self.inner.accept()?;
        Connection::wrap(socket, false, config, logger, dispatcher)
    }
}

#[cfg(test)]
mod test_listener {
    use super::*;
    use std::net::TcpStream;
    use std::thread;

    #[test]
    fn accept_completes_a_handshake_with_a_dialing_client() {
        let listener = Listener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || listener.accept(ConnectionConfig::default(), None, None).unwrap());

        let client_socket = TcpStream::connect(addr).unwrap();
        let client = Connection::wrap(client_socket, true, ConnectionConfig::default(), None, None).unwrap();
        let server = server.join().unwrap();

        assert!(client.connected());
        assert!(server.connected());

        client.close();
        server.close();
    }
}
