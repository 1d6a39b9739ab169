//! Free-port probing for share backends. Ports are claimed by bind-testing
//! on the loopback interface, starting from 9000, optionally requiring a
//! run of consecutive free ports (FTP's passive window).

use std::net::TcpListener;

use anyhow::{bail, Context, Result};

const SHARE_PORT_RANGE_START: u16 = 9000;

/// The first port from 9000 upwards where the port itself and `subsequent`
/// ports after it are all free.
pub fn network_share_port(subsequent: u16) -> Result<u16> {
    closest_avail_port_with_subsequent(SHARE_PORT_RANGE_START, subsequent)
}

fn closest_avail_port_with_subsequent(start: u16, subsequent: u16) -> Result<u16> {
    let mut port = start;
    while port < u16::MAX {
        if check_port_available(port, subsequent)
            .with_context(|| format!("check port available ({port})"))?
        {
            return Ok(port);
        }

        match port.checked_add(1 + subsequent) {
            Some(next) => port = next,
            None => break,
        }
    }

    bail!("no available port (with {subsequent} subsequent ones) found")
}

fn check_port_available(port: u16, subsequent: u16) -> Result<bool> {
    if port.checked_add(subsequent).is_none() {
        bail!("subsequent ports exceed allowed port range");
    }

    if subsequent == 0 {
        return match TcpListener::bind(("127.0.0.1", port)) {
            Ok(listener) => {
                drop(listener);
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => Ok(false),
            Err(err) => Err(err).with_context(|| format!("net listen (port {port})")),
        };
    }

    for i in 0..=subsequent {
        let ok = check_port_available(port + i, 0)
            .with_context(|| format!("check subsequent port available (base: {port}, seq: {i})"))?;
        if !ok {
            return Ok(false);
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_port_starts_at_9000() {
        let port = network_share_port(0).unwrap();
        assert!(port >= 9000);
    }

    #[test]
    fn occupied_port_is_skipped() {
        let base = network_share_port(0).unwrap();
        let _holder = TcpListener::bind(("127.0.0.1", base)).unwrap();

        let next = network_share_port(0).unwrap();
        assert_ne!(next, base);
        assert!(next > base);
    }

    #[test]
    fn subsequent_window_requires_a_free_run() {
        let base = network_share_port(9).unwrap();
        assert!(base >= 9000);

        // Occupy a port in the middle of the found window and probe again:
        // the window must move past the occupied port.
        let _holder = TcpListener::bind(("127.0.0.1", base + 4)).unwrap();
        let moved = network_share_port(9).unwrap();
        assert!(moved > base + 4 || moved + 9 < base + 4);
    }

    #[test]
    fn overflowing_window_is_rejected() {
        let err = check_port_available(65530, 10).unwrap_err();
        assert!(err.to_string().contains("exceed allowed port range"));
    }
}
