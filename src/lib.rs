//! Library crate for portquiz: probes which TCP/UDP ports of a host are reachable
//! through NAT and firewalls by exchanging a shared secret with a cooperating
//! responder.
pub mod config;
pub mod coordinator;
pub mod netdetect;
pub mod ports;
pub mod probe;
pub mod protocol;
pub mod redirect;
pub mod responder;
pub mod retry;
pub mod scanner;
pub mod types;
