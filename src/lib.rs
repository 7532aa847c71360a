//! Spectral characterisation of THz time-domain phi scans.
//!
//! A phi scan is a set of waveforms of one sample, recorded while it is rotated from
//! 90° to -90°. The pipeline reads the waveforms ([`io`]), transforms them into
//! windowed, zero-padded spectra ([`spectral`]) and normalizes a sample scan against a
//! reference scan row by row ([`normalize`], [`phase`]). [`data_thread`] runs the whole
//! chain behind a command channel.

pub mod config;
pub mod data_container;
pub mod data_thread;
pub mod error;
pub mod io;
pub mod math_tools;
pub mod normalize;
pub mod phase;
pub mod spectral;
