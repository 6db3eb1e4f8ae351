//! Opaque per-step switch/interconnect credential.
//!
//! The core never interprets these — it only packs, forwards, and unpacks
//! them on behalf of whichever interconnect plugin owns the variant. A
//! sealed enum (rather than a shared "machine descriptor" struct with a
//! type tag) keeps distinct kinds distinct by construction.

use crate::error::CoreError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepCredential {
    /// No interconnect-specific state; used for single-node or
    /// shared-memory steps.
    None,
    /// Opaque bytes owned by an external switch plugin, plus a monotonic
    /// key distinguishing concurrent credentials for the same step.
    Switch { key: u64, payload: Vec<u8> },
}

impl StepCredential {
    /// §4.F / §9: a credential-build failure must propagate, never
    /// silently return an incomplete-but-non-null value.
    pub fn build_switch(key: u64, payload: Vec<u8>) -> Result<Self, CoreError> {
        if payload.is_empty() {
            return Err(CoreError::Invalid(
                "switch credential payload is empty".into(),
            ));
        }
        Ok(Self::Switch { key, payload })
    }

    pub fn pack(&self) -> Vec<u8> {
        match self {
            StepCredential::None => vec![0u8],
            StepCredential::Switch { key, payload } => {
                let mut out = vec![1u8];
                out.extend_from_slice(&key.to_be_bytes());
                out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                out.extend_from_slice(payload);
                out
            }
        }
    }

    pub fn unpack(bytes: &[u8]) -> Result<Self, CoreError> {
        match bytes.first() {
            Some(0) => Ok(StepCredential::None),
            Some(1) => {
                if bytes.len() < 13 {
                    return Err(CoreError::PersistCorrupt(
                        "truncated switch credential".into(),
                    ));
                }
                let key = u64::from_be_bytes(bytes[1..9].try_into().unwrap());
                let len = u32::from_be_bytes(bytes[9..13].try_into().unwrap()) as usize;
                let payload = bytes
                    .get(13..13 + len)
                    .ok_or_else(|| CoreError::PersistCorrupt("credential payload short".into()))?
                    .to_vec();
                Ok(StepCredential::Switch { key, payload })
            }
            _ => Err(CoreError::PersistCorrupt(
                "unknown credential tag".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_round_trips() {
        let c = StepCredential::None;
        assert_eq!(StepCredential::unpack(&c.pack()).unwrap(), c);
    }

    #[test]
    fn switch_round_trips() {
        let c = StepCredential::build_switch(7, vec![1, 2, 3]).unwrap();
        assert_eq!(StepCredential::unpack(&c.pack()).unwrap(), c);
    }

    #[test]
    fn empty_payload_build_fails() {
        assert!(StepCredential::build_switch(1, vec![]).is_err());
    }

    #[test]
    fn truncated_bytes_are_corrupt() {
        assert!(matches!(
            StepCredential::unpack(&[1, 0, 0]),
            Err(CoreError::PersistCorrupt(_))
        ));
    }
}
