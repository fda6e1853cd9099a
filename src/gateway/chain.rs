use crate::config::ConnectOptions;
use crate::gateway::describe_chain;
use crate::server::ServerDescriptor;
use crate::ssh::{Transport, TunnelHandle};
use crate::utils::error::ConnectError;
use log::{debug, info};
use std::sync::Arc;

/// A composed multi-hop tunnel.
///
/// Each hop after the first runs over a port forwarded by the hop before
/// it, so every hop must outlive the ones stacked on top of it. The chain
/// owns all of them and forwards through the last.
pub struct ChainTunnel {
    hops: Vec<Arc<dyn TunnelHandle>>,
}

impl TunnelHandle for ChainTunnel {
    fn open(&self, host: &str, port: u16) -> Result<u16, ConnectError> {
        match self.hops.last() {
            Some(last) => last.open(host, port),
            None => Err(ConnectError::new(
                format!("{host}:{port}"),
                "empty gateway chain",
            )),
        }
    }
}

/// Composes `[g0, g1, ..., gn]` into a single tunnel ending at `gn`.
///
/// Only `g0` is dialed directly. Every later hop is reached through a port
/// forwarded by the previous hop's tunnel, so intermediate gateways never
/// need to be reachable from this machine.
pub fn build_chain(
    hops: &[ServerDescriptor],
    transport: &dyn Transport,
    options: &ConnectOptions,
) -> Result<Arc<dyn TunnelHandle>, ConnectError> {
    let (first, rest) = hops
        .split_first()
        .ok_or_else(|| ConnectError::new("gateway", "empty gateway chain"))?;

    debug!("Opening gateway tunnel to {}", first);
    let first_tunnel = transport.open_tunnel(first, options)?;
    if rest.is_empty() {
        info!("Gateway ready: {}", first);
        return Ok(first_tunnel);
    }

    let mut opened = vec![first_tunnel];
    for hop in rest {
        let previous = opened.last().map(Arc::clone).ok_or_else(|| {
            ConnectError::for_server(hop, "gateway chain lost its previous hop")
        })?;
        let local_port = previous.open(&hop.host, hop.port_or_default())?;
        let via = hop.forwarded_to(local_port);
        debug!("Opening gateway tunnel to {} via {}", hop, via);
        let tunnel = transport
            .open_tunnel(&via, options)
            .map_err(|e| ConnectError::for_server(hop, e.reason))?;
        opened.push(tunnel);
    }

    info!("Gateway chain ready: {}", describe_chain(hops));
    Ok(Arc::new(ChainTunnel { hops: opened }))
}
