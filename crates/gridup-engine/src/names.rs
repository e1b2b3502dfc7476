//! Simulation-run identities and resource naming.
//!
//! Every object a trial creates is named `<base>-sr-<token>`. The literal
//! `-sr-` separator is load-bearing: splitting on it recovers the original
//! name, so the token alphabet must never contain `-`.

use std::collections::BTreeMap;

use rand::Rng;

use gridup_core::constants::SIM_RUN_LABEL_KEY;
use gridup_core::{Taint, TaintEffect, Toleration};

const SIM_RUN_SEPARATOR: &str = "-sr-";
const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_LEN: usize = 6;

/// Per-trial identity: the simulation-run label key paired with a random
/// token. Doubles as the label, the node taint, and the pod toleration
/// that isolate concurrent trials from each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRef {
    pub key: &'static str,
    pub value: String,
}

impl RunRef {
    pub fn new() -> Self {
        Self::with_rng(&mut rand::thread_rng())
    }

    /// Generate a run-ref from the given RNG, so replays under a fixed
    /// seed reproduce the same identities.
    pub fn with_rng(rng: &mut impl Rng) -> Self {
        RunRef {
            key: SIM_RUN_LABEL_KEY,
            value: random_token_with(rng, TOKEN_LEN),
        }
    }

    pub fn taint(&self) -> Taint {
        Taint {
            key: self.key.to_string(),
            value: self.value.clone(),
            effect: TaintEffect::NoSchedule,
        }
    }

    pub fn toleration(&self) -> Toleration {
        Toleration::equal(self.key, &self.value)
    }

    pub fn as_label_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(self.key.to_string(), self.value.clone())])
    }

    /// `<base>-sr-<token>` name for an object this trial owns.
    pub fn resource_name(&self, base: &str) -> String {
        format!("{base}{SIM_RUN_SEPARATOR}{}", self.value)
    }
}

impl Default for RunRef {
    fn default() -> Self {
        Self::new()
    }
}

/// Random lowercase-alphanumeric token; the alphabet is disjoint from the
/// separator character.
pub(crate) fn random_token_with(rng: &mut impl Rng, len: usize) -> String {
    (0..len)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

/// Strip the simulation-run suffix off a name. Names without the separator
/// come back unchanged.
pub fn to_original_resource_name(sim_name: &str) -> String {
    sim_name
        .split(SIM_RUN_SEPARATOR)
        .next()
        .unwrap_or(sim_name)
        .to_string()
}
