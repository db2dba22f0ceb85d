//! The ftrace ingestion engine
//!
//! Four cooperating pieces, mirroring the layering of the kernel interface:
//!
//! - [`tracefs`] - typed read/write wrapper over the tracefs file tree
//! - [`muxer`] - unions concurrent session configs onto the shared kernel state
//! - [`translation`] - reflects runtime event layouts into a fixed decoder plan
//! - [`cpu_reader`] - drains per-cpu raw ring buffers and decodes records
//!
//! [`controller`] owns instances and session lifecycle and drives the whole
//! thing from a single-threaded cooperative task loop.

pub mod atrace;
pub mod bundler;
pub mod compact_sched;
pub mod config;
pub mod controller;
pub mod cpu_reader;
pub mod event_info;
pub mod format;
pub mod metadata;
pub mod muxer;
pub mod print_filter;
pub mod printk;
pub mod symbolizer;
pub mod syscalls;
pub mod tracefs;
pub mod translation;
