use std::collections::HashSet;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::ops::RangeInclusive;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

pub fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1" | "0.0.0.0")
}

/// Pick a random free port in `range`, probing at most `max_probes` distinct
/// ports. A port that turns out to be taken is never probed again.
pub fn probe_ports<R, F>(
    range: RangeInclusive<u16>,
    max_probes: usize,
    rng: &mut R,
    mut is_free: F,
) -> Option<u16>
where
    R: Rng,
    F: FnMut(u16) -> bool,
{
    if range.is_empty() {
        return None;
    }
    let span = usize::from(*range.end() - *range.start()) + 1;
    let budget = max_probes.min(span);
    let mut tried = HashSet::with_capacity(budget);

    while tried.len() < budget {
        let port = rng.gen_range(range.clone());
        if !tried.insert(port) {
            continue;
        }
        if is_free(port) {
            return Some(port);
        }
        debug!(port, "port busy, re-probing");
    }
    None
}

/// Find a free TCP port on `host`.
///
/// Local hosts are checked by binding the port; remote hosts by attempting a
/// connection, where a refused connection means nobody is listening. Both
/// checks block, so the search runs on the blocking pool.
pub async fn find_free_port(
    host: &str,
    range: RangeInclusive<u16>,
    max_probes: usize,
) -> Option<u16> {
    let host = host.to_string();
    match tokio::task::spawn_blocking(move || search_host(&host, range, max_probes)).await {
        Ok(port) => port,
        Err(e) => {
            warn!(error = %e, "Port search task failed");
            None
        }
    }
}

fn search_host(host: &str, range: RangeInclusive<u16>, max_probes: usize) -> Option<u16> {
    let mut rng = rand::thread_rng();
    if is_local_host(host) {
        probe_ports(range, max_probes, &mut rng, |port| {
            TcpListener::bind(("0.0.0.0", port)).is_ok()
        })
    } else {
        probe_ports(range, max_probes, &mut rng, |port| remote_port_free(host, port))
    }
}

fn remote_port_free(host: &str, port: u16) -> bool {
    let Ok(mut addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    match addrs.next() {
        Some(addr) => TcpStream::connect_timeout(&addr, CONNECT_PROBE_TIMEOUT).is_err(),
        None => false,
    }
}
