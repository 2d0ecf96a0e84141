#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

//! # Getting started
//!
//! Bring a [`Transport`] (a PC/SC binding, or [`mocktag::MockTag`] in
//! tests), open a [`keystore::KeyStore`], and drive a
//! [`provision::Provisioner`]:
//!
//! ```ignore
//! use ntag424_dna::{keystore::KeyStore, provision::{Provisioner, SdmMode}};
//!
//! let store = KeyStore::open("keys.csv")?;
//! let report = Provisioner::new(&store).provision(
//!     &mut reader,
//!     "https://example.com/t?uid=00000000000000&ctr=000000&cmac=0000000000000000",
//!     SdmMode::Cmac,
//! )?;
//! println!("provisioned {}", report.uid);
//! ```
//!
//! On the server side, [`validator::Validator`] checks the URLs those
//! tags emit and rejects replays.

pub mod apdu;
pub mod command;
pub mod crypto;
pub mod keystore;
#[cfg(any(test, feature = "mocktag"))]
pub mod mocktag;
pub mod ndef;
pub mod provision;
pub mod session;
pub mod transport;
mod uid;
pub mod validator;

pub use crate::{
    apdu::{Apdu, ResponseApdu, StatusWord},
    command::CommMode,
    crypto::Key,
    keystore::{KeyRecord, KeyStore},
    provision::{Provisioner, SdmMode},
    session::Session,
    transport::Transport,
    uid::Uid,
    validator::Validator,
};
