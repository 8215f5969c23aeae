use crate::config::DnsService;
use crate::context::Context;
use crate::dns::handlers::Handler;
use crate::dns::Resolver;
use tokio::net::{TcpListener, UdpSocket};
use trust_dns_server::ServerFuture;

/// Bind a DNS server answering over both UDP and TCP on the service's address.
pub async fn new(context: Context, service: &DnsService) -> anyhow::Result<ServerFuture<Handler>> {
    let addr = service.addr();
    let tcp_timeout = context.config.dns_tcp_timeout;
    let dns_handler = Handler::new(Resolver::new(context));
    let mut dns_server = ServerFuture::new(dns_handler);
    dns_server.register_socket(UdpSocket::bind(addr).await?);
    dns_server.register_listener(TcpListener::bind(addr).await?, tcp_timeout);
    Ok(dns_server)
}
