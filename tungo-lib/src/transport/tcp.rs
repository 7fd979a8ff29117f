use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

pub async fn dial(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    // the tunnel already batches at frame granularity
    stream.set_nodelay(true)?;
    Ok(stream)
}

pub async fn listen(addr: SocketAddr) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

pub fn configure_accepted(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
}
