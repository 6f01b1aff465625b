use color_eyre::eyre::{Result, WrapErr};

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::num::NonZeroU16;
use tokio::net::TcpListener;
use tokio::sync::watch;

mod logging;
pub use logging::setup_errors;
#[allow(unused_imports)] // used by unit tests
pub(crate) use logging::setup_test_tracing;
pub use logging::setup_tracing;

pub async fn open_socket(port: Option<NonZeroU16>) -> Result<(TcpListener, u16)> {
    let ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    let addr = SocketAddr::new(ip, port.map(NonZeroU16::get).unwrap_or(0));
    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Could not bind to address: {addr}"))?;

    let open_port = listener.local_addr()?.port();
    match port {
        None => tracing::trace!("OS assigned free TCP port: {open_port}"),
        Some(p) => tracing::trace!("opend TCP port: {p}"),
    }
    Ok((listener, open_port))
}

/// Resolves once shutdown is signalled, or the signalling side is gone
pub async fn until_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

pub fn div_ceil(numerator: usize, denominator: usize) -> usize {
    (numerator + denominator - 1) / denominator
}
