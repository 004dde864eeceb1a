//! The issuance engine's decision core: per-class inventory, certificate
//! numbering, and startup recovery (spec section 4.1 and 3).
//!
//! Nothing in this crate touches a socket. `certissue-engine` is meant to be
//! driven by exactly one caller at a time — the single decision thread that
//! `engine-server` runs — so none of its state is behind a lock; the
//! single-writer discipline lives in the caller, not here.

use certissue_journal::{Journal, Record};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

/// Configured share class: its tag and the total shares it may ever issue.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassConfig {
    pub tag: String,
    pub authorized: u64,
}

/// In-memory inventory for one share class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassState {
    pub authorized: u64,
    pub issued: u64,
    pub next_certificate_number: u64,
}

impl ClassState {
    fn new(authorized: u64) -> Self {
        ClassState {
            authorized,
            issued: 0,
            next_certificate_number: 1,
        }
    }
}

/// Reasons a grant is rejected, matching spec section 4.1/4.2/7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantError {
    UnknownClass,
    InvalidAmount,
    InsufficientShares,
    Malformed,
}

/// Why a call into `Engine::grant` failed to commit. `JournalFault` is
/// fatal to the whole process (spec section 4.1 Failure semantics); the
/// others are ordinary, recoverable rejections.
#[derive(Debug)]
pub enum DecisionError {
    Rejected(GrantError),
    JournalFault(certissue_journal::Error),
}

impl From<GrantError> for DecisionError {
    fn from(e: GrantError) -> Self {
        DecisionError::Rejected(e)
    }
}

#[derive(Debug)]
pub struct RecoveryError(pub String);

impl std::fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "journal recovery failed: {}", self.0)
    }
}

impl std::error::Error for RecoveryError {}

/// The authoritative per-class ledger: the whole of the engine's mutable
/// state, recovered from the journal at startup.
#[derive(Debug)]
pub struct Engine {
    classes: HashMap<String, ClassState>,
}

impl Engine {
    /// Build the ledger from configuration, then replay `records` (already
    /// read from the journal in file order) to reconstruct `issued` and
    /// `next_certificate_number`, verifying the invariants spec section 3
    /// requires before startup may proceed.
    pub fn recover(configs: &[ClassConfig], records: &[Record]) -> Result<Engine, RecoveryError> {
        let mut classes: HashMap<String, ClassState> = configs
            .iter()
            .map(|c| (c.tag.clone(), ClassState::new(c.authorized)))
            .collect();

        let mut counts: HashMap<&str, u64> = HashMap::new();

        for record in records {
            let state = classes.get_mut(record.class_tag.as_str()).ok_or_else(|| {
                RecoveryError(format!(
                    "journal references unconfigured class {:?}",
                    record.class_tag
                ))
            })?;

            state.issued = state.issued.checked_add(record.amount as u64).ok_or_else(|| {
                RecoveryError(format!("issued overflow for class {:?}", record.class_tag))
            })?;
            state.next_certificate_number =
                state.next_certificate_number.max(record.certificate_number + 1);

            *counts.entry(record.class_tag.as_str()).or_insert(0) += 1;
        }

        for (tag, state) in classes.iter() {
            let count = counts.get(tag.as_str()).copied().unwrap_or(0);
            if state.next_certificate_number != count + 1 {
                return Err(RecoveryError(format!(
                    "class {tag:?}: next_certificate_number {} does not match replayed grant count {count}",
                    state.next_certificate_number
                )));
            }
            if state.issued > state.authorized {
                return Err(RecoveryError(format!(
                    "class {tag:?}: issued {} exceeds authorized {}",
                    state.issued, state.authorized
                )));
            }
        }

        Ok(Engine { classes })
    }

    /// Run one grant decision end to end: validate, check inventory,
    /// durably journal, then commit in memory. Returns the assigned
    /// certificate number on success.
    pub fn grant(
        &mut self,
        journal: &mut Journal,
        class_tag: &str,
        holder_name: &str,
        amount: u32,
    ) -> Result<u64, DecisionError> {
        if class_tag.is_empty() || holder_name.contains(['\n', '\r']) {
            return Err(GrantError::Malformed.into());
        }
        if amount == 0 {
            return Err(GrantError::InvalidAmount.into());
        }

        let state = self
            .classes
            .get(class_tag)
            .ok_or(GrantError::UnknownClass)?;

        if state.issued + amount as u64 > state.authorized {
            return Err(GrantError::InsufficientShares.into());
        }

        let certificate_number = state.next_certificate_number;
        let record = Record {
            class_tag: class_tag.to_string(),
            certificate_number,
            amount,
            holder_name: holder_name.to_string(),
        };

        journal.append(&record).map_err(DecisionError::JournalFault)?;

        // Only after the journal confirms durability do we mutate memory.
        let state = self.classes.get_mut(class_tag).expect("class checked above");
        state.issued += amount as u64;
        state.next_certificate_number += 1;

        Ok(certificate_number)
    }

    pub fn class_state(&self, class_tag: &str) -> Option<&ClassState> {
        self.classes.get(class_tag)
    }

    pub fn classes(&self) -> impl Iterator<Item = (&str, &ClassState)> {
        self.classes.iter().map(|(k, v)| (k.as_str(), v))
    }
}
