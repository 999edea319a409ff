//! Service discovery using mDNS/DNS-SD
//!
//! Advertises the satellite on the local network so controllers can
//! discover it without manual configuration

pub mod mdns;

pub use mdns::MdnsAdvertiser;
