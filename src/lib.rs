//! This crate exposes the internal functionality of the gscan address scanner.
//!
//! gscan walks large IPv4 range lists and keeps the addresses that front a
//! target service. Every address is confirmed by several protocol samples and
//! the survivors are ranked by round-trip time.
//!
//! ## Architecture Overview
//!
//! The core scanning behaviour is managed by
//! [`Scanner`](crate::scanner::Scanner) which in turn requires a
//! [`Probe`](crate::probe::Probe). The scanning process follows this flow:
//!
//! 1. **Range loading**: range directives are parsed and reduced to a minimal set
//! 2. **Feeding**: one producer walks the ranges lazily into a bounded channel
//! 3. **Verification**: a worker pool runs the optional ICMP gate and then the
//!    protocol samples for each address
//! 4. **Collection**: accepted addresses land in a [`ResultLedger`](crate::ledger::ResultLedger)
//!    until the input ends, the record limit is reached or the operator interrupts
//! 5. **Output**: records are ranked by RTT and written out with a timestamped backup
//!
//! ## Basic Usage Example
//!
//! ```rust
//! use std::net::Ipv4Addr;
//! use std::time::Duration;
//!
//! use gscan::address::AddressRange;
//! use gscan::probe::Probe;
//! use gscan::scanner::Scanner;
//! use tokio_util::sync::CancellationToken;
//!
//! // Accepts every address after a fixed delay.
//! struct Always;
//!
//! impl Probe for Always {
//!     async fn sample(&self, _ip: Ipv4Addr) -> Option<Duration> {
//!         tokio::time::sleep(Duration::from_millis(1)).await;
//!         Some(Duration::from_millis(1))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let ranges: Vec<AddressRange> = vec!["192.0.2.0/29".parse().unwrap()];
//!     let scanner = Scanner::new(
//!         ranges,
//!         Always,
//!         4,              // Workers
//!         2,              // Samples per address
//!         Duration::ZERO, // Minimum RTT
//!         100,            // Record limit
//!     );
//!
//!     let ledger = scanner.run(CancellationToken::new()).await;
//!     assert_eq!(ledger.scan_count(), 8);
//!     assert_eq!(ledger.record_size(), 8);
//! }
//! ```
//!
//! ## Verification Levels
//!
//! - **1**: the handshake completes and the peer presents certificates
//! - **2**: a pinned key sits at the intermediate position, or for SNI the leaf
//!   CommonName equals the requested name
//! - **3**: an HTTP request over the same channel answers with a 2xx or 3xx status
//! - **4**: the response body is not the storage service's `NoSuchBucket` error
#![allow(clippy::needless_doctest_main)]
#![warn(missing_docs)]

pub mod address;

pub mod icmp;

pub mod input;

pub mod ledger;

pub mod output;

pub mod probe;

pub mod scanner;
