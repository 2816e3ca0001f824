// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the Endorsement Client Core.
//

//! Signing and verification seams.
//!
//! Enrollment and key storage live outside this crate; the core only needs
//! something that can sign bytes and present a certificate, and optionally
//! something that can check an endorser's signature.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw signature bytes produced by a [`SigningIdentity`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0))
    }
}

/// Serialized identity certificate of a submitter or an endorser.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Certificate(pub Vec<u8>);

impl Certificate {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) => write!(f, "Certificate({text:?})"),
            Err(_) => write!(f, "Certificate({} bytes)", self.0.len()),
        }
    }
}

/// An enrolled identity able to sign on behalf of the submitter.
pub trait SigningIdentity: Send + Sync {
    fn sign(&self, message: &[u8]) -> anyhow::Result<Signature>;

    fn certificate(&self) -> Certificate;
}

/// Checks endorser signatures before the policy counts them.
pub trait EndorsementVerifier: Send + Sync {
    fn verify(&self, endorser: &Certificate, message: &[u8], signature: &Signature) -> bool;
}
