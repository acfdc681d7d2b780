//! Process-wide default server
//!
//! Convenience wrappers for programs that only ever need one server.

use std::sync::OnceLock;

use tokio::net::TcpListener;

use crate::protocol::Result;
use crate::server::Server;
use crate::service::Service;

static DEFAULT_SERVER: OnceLock<Server> = OnceLock::new();

/// The default server, created on first use.
pub fn default_server() -> &'static Server {
    DEFAULT_SERVER.get_or_init(Server::new)
}

/// Publish a service on the default server.
pub fn register(service: impl Into<Service>) -> Result<()> {
    default_server().register(service)
}

/// Serve connections from `listener` with the default server.
pub async fn accept(listener: TcpListener) -> Result<()> {
    default_server().accept(listener).await
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Clock;

    #[test]
    fn test_default_server_is_shared() {
        register(Service::new(Clock).method("Now", |_: &Clock, (): ()| Ok::<_, String>(0_u64)))
            .unwrap();
        assert!(default_server().find_service("Clock.Now").is_ok());
        assert!(std::ptr::eq(default_server(), default_server()));
    }
}
