use std::collections::{HashMap, HashSet};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{
    backend::{InferRequest, StateValue},
    tokenizer::TokenizerError,
};

pub const ADD_SPECIAL_TOKENS: &str = "add_special_tokens";
pub const SKIP_SPECIAL_TOKENS: &str = "skip_special_tokens";
pub const MAX_LENGTH: &str = "max_length";
pub const PAD_TO_MAX_LENGTH: &str = "pad_to_max_length";
pub const IS_MAX_LENGTH_SET: &str = "is_max_length_set";

/// Per-call encoding flags. Omitted fields use the tokenizer's compiled defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncodeOptions {
    /// Defaults to `true`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_special_tokens: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Defaults to `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pad_to_max_length: Option<bool>,
}

impl EncodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_add_special_tokens(mut self, add_special_tokens: bool) -> Self {
        self.add_special_tokens = Some(add_special_tokens);
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_pad_to_max_length(mut self, pad_to_max_length: bool) -> Self {
        self.pad_to_max_length = Some(pad_to_max_length);
        self
    }
}

/// Per-call decoding flags.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecodeOptions {
    /// Defaults to `true`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_special_tokens: Option<bool>,
}

impl DecodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skip_special_tokens(mut self, skip_special_tokens: bool) -> Self {
        self.skip_special_tokens = Some(skip_special_tokens);
        self
    }
}

/// What a set of options asks of one request state variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requested {
    /// The state belongs to the other direction; leave it alone.
    NotApplicable,
    /// Omitted: the compiled default.
    Default,
    Value(StateValue),
}

pub trait RequestFlags {
    fn requested(&self, state: &str) -> Result<Requested>;
}

fn requested_bool(value: Option<bool>) -> Requested {
    value.map_or(Requested::Default, |v| Requested::Value(StateValue::Bool(v)))
}

impl RequestFlags for EncodeOptions {
    fn requested(&self, state: &str) -> Result<Requested> {
        Ok(match state {
            ADD_SPECIAL_TOKENS => requested_bool(self.add_special_tokens),
            PAD_TO_MAX_LENGTH => requested_bool(self.pad_to_max_length),
            // Derived from `max_length` so the two cannot disagree.
            IS_MAX_LENGTH_SET => requested_bool(self.max_length.map(|_| true)),
            MAX_LENGTH => match self.max_length {
                Some(len) => {
                    let len =
                        i32::try_from(len).map_err(|_| TokenizerError::MaxLengthOverflow(len))?;
                    Requested::Value(StateValue::I32(len))
                }
                None => Requested::Default,
            },
            _ => Requested::NotApplicable,
        })
    }
}

impl RequestFlags for DecodeOptions {
    fn requested(&self, state: &str) -> Result<Requested> {
        Ok(match state {
            SKIP_SPECIAL_TOKENS => requested_bool(self.skip_special_tokens),
            _ => Requested::NotApplicable,
        })
    }
}

/// The flag values last applied to one pooled request.
///
/// Only touched while the owning request is acquired, so it needs no lock of its own.
#[derive(Debug, Default)]
pub struct StateFlags {
    applied: HashMap<String, StateValue>,
    /// States that have been synchronised at least once.
    synced: HashSet<String>,
}

impl StateFlags {
    pub fn get(&self, state: &str) -> Option<StateValue> {
        self.applied.get(state).copied()
    }

    /// Bring `request`'s state variables in line with `flags`, touching only those that change.
    ///
    /// A requested value differing from the recorded one is set and recorded. An
    /// omitted flag resets the state if something is recorded, or if this state has
    /// never been synchronised on this request.
    pub fn sync(&mut self, request: &mut dyn InferRequest, flags: &dyn RequestFlags) -> Result<()> {
        for state in request.state_names() {
            let outcome = match flags.requested(&state)? {
                Requested::NotApplicable => continue,
                Requested::Value(value) => {
                    if self.applied.get(&state) == Some(&value) {
                        continue;
                    }
                    request.set_state(&state, value).map(|()| {
                        self.applied.insert(state.clone(), value);
                    })
                }
                Requested::Default => {
                    let had_value = self.applied.remove(&state).is_some();
                    if !had_value && self.synced.contains(&state) {
                        continue;
                    }
                    request.reset_state(&state)
                }
            };
            match outcome {
                Ok(()) => {
                    self.synced.insert(state);
                }
                Err(e) => {
                    // Unknown backend state now; force a full resync next time.
                    self.applied.remove(&state);
                    self.synced.remove(&state);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TensorValue;

    #[derive(Default)]
    struct RecordingRequest {
        calls: Vec<String>,
    }

    impl InferRequest for RecordingRequest {
        fn set_input(&mut self, _: usize, _: TensorValue) -> Result<()> {
            Ok(())
        }
        fn infer(&mut self) -> Result<()> {
            Ok(())
        }
        fn output(&self, name: &str) -> Result<TensorValue> {
            anyhow::bail!("no output `{name}`")
        }
        fn state_names(&self) -> Vec<String> {
            [ADD_SPECIAL_TOKENS, MAX_LENGTH, PAD_TO_MAX_LENGTH, IS_MAX_LENGTH_SET]
                .map(String::from)
                .to_vec()
        }
        fn set_state(&mut self, name: &str, value: StateValue) -> Result<()> {
            self.calls.push(format!("set {name}={value:?}"));
            Ok(())
        }
        fn reset_state(&mut self, name: &str) -> Result<()> {
            self.calls.push(format!("reset {name}"));
            Ok(())
        }
    }

    #[test]
    fn first_sync_resets_omitted_states_once() {
        let mut req = RecordingRequest::default();
        let mut flags = StateFlags::default();
        flags.sync(&mut req, &EncodeOptions::default()).unwrap();
        assert_eq!(req.calls.len(), 4);
        assert!(req.calls.iter().all(|c| c.starts_with("reset")));

        req.calls.clear();
        flags.sync(&mut req, &EncodeOptions::default()).unwrap();
        assert!(req.calls.is_empty());
    }

    #[test]
    fn only_changed_values_reach_the_request() {
        let mut req = RecordingRequest::default();
        let mut flags = StateFlags::default();
        let opts = EncodeOptions::new().with_add_special_tokens(false);
        flags.sync(&mut req, &opts).unwrap();
        req.calls.clear();

        flags.sync(&mut req, &opts).unwrap();
        assert!(req.calls.is_empty());
        assert_eq!(flags.get(ADD_SPECIAL_TOKENS), Some(StateValue::Bool(false)));

        flags.sync(&mut req, &EncodeOptions::default()).unwrap();
        assert_eq!(req.calls, vec!["reset add_special_tokens".to_string()]);
        assert_eq!(flags.get(ADD_SPECIAL_TOKENS), None);
    }

    #[test]
    fn max_length_drives_is_max_length_set() {
        let mut req = RecordingRequest::default();
        let mut flags = StateFlags::default();
        flags
            .sync(&mut req, &EncodeOptions::new().with_max_length(8))
            .unwrap();
        assert_eq!(flags.get(MAX_LENGTH), Some(StateValue::I32(8)));
        assert_eq!(flags.get(IS_MAX_LENGTH_SET), Some(StateValue::Bool(true)));

        req.calls.clear();
        flags.sync(&mut req, &EncodeOptions::default()).unwrap();
        assert_eq!(
            req.calls,
            vec!["reset max_length".to_string(), "reset is_max_length_set".to_string()]
        );
    }

    #[test]
    fn decode_options_leave_encode_states_alone() {
        let mut req = RecordingRequest::default();
        let mut flags = StateFlags::default();
        flags.sync(&mut req, &DecodeOptions::default()).unwrap();
        assert!(req.calls.is_empty());
    }

    #[test]
    fn unknown_option_keys_are_rejected() {
        let ok: EncodeOptions =
            serde_json::from_str(r#"{"add_special_tokens": false, "max_length": 4}"#).unwrap();
        assert_eq!(ok.max_length, Some(4));
        assert!(serde_json::from_str::<EncodeOptions>(r#"{"max_len": 4}"#).is_err());
        assert!(serde_json::from_str::<DecodeOptions>(r#"{"skip_special": true}"#).is_err());
    }

    #[test]
    fn oversized_max_length_is_an_error() {
        let mut req = RecordingRequest::default();
        let mut flags = StateFlags::default();
        let opts = EncodeOptions::new().with_max_length(usize::MAX);
        assert!(flags.sync(&mut req, &opts).is_err());
    }
}
