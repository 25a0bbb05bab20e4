// (c) 2024 Ross Younger

#![allow(clippy::doc_markdown)]
//! `insint` is the interface between an observatory's central control process and an
//! instrument control computer (the OBCP).
//!
//! ## 📖 Documentation
//!
//! * [About the wire protocols](protocol)
//! * [Configuring insint](config)
//! * [The interfaces](interface)
//!
//! ## Overview
//!
//! insint lets the control process
//! - 🛰️ issue device-dependent commands, and learn asynchronously whether they were accepted and how they completed;
//! - 📋 answer the OBCP's requests for status values;
//! - 📥 receive unsolicited status table pushes from the OBCP;
//! - 🗂️ receive the frame files the OBCP produces, fetched in parallel groups with a selectable transfer mechanism.
//!
//! Everything travels as SOSS messages carried by ONC-RPC over TCP or UDP.
//! Every command round trip is tracked in a shared [transaction store](store), whose changes
//! are published to subscribers on an event bus.
//!
//! ## 🧰 Getting Started
//!
//! * Tell insint which OBCP it serves, and where to find it:
//!   `insint --obcp-num 9 --obcp-host obcp9`
//! * Choose the interfaces to run with `--interfaces` (default: `cmd,file,sreq,sdst`).
//! * Send a single command and wait for it to complete:
//!   `insint --send mytag "EXEC OBE MOVE"`
//! * Settings can also live in a [configuration file](config); `insint --show-config` shows
//!   where each value came from.
//!
//! ## How it works
//!
//! The [container](container) owns a worker pool, the transaction store and one
//! [link](interface::link) per interface. Each link pairs an RPC [server] (the OBCP calls us)
//! with a lazily-connected [call channel](transport) (we call the OBCP).
//! Message handling happens on the worker pool, never on the listeners.
//!
//! #### MSRV policy
//!
//! As this is an application crate, the MSRV is not guaranteed to remain stable.
//! The MSRV may be upgraded from time to time to take advantage of new language features.
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub(crate) mod cli;
pub use cli::cli as main;

pub mod config;
pub use config::structure::Configuration;

pub mod container;
pub mod interface;
pub mod protocol;
pub mod server;
pub mod store;
pub mod transport;
pub mod util;

mod version;
