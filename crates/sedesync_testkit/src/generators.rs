//! Property-based test generators using proptest.

use proptest::prelude::*;
use sedesync_protocol::{FieldValue, SiteCode, Snapshot};

/// Strategy for generating field names.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z_]{0,15}")
        .expect("valid regex")
        .prop_filter("non-empty", |s| !s.is_empty())
}

/// Strategy for generating decimal amounts as text.
pub fn decimal_text_strategy() -> impl Strategy<Value = String> {
    (0i64..1_000_000, 0u8..100).prop_map(|(units, cents)| format!("{units}.{cents:02}"))
}

/// Strategy for generating scalar field values.
pub fn field_value_strategy() -> impl Strategy<Value = FieldValue> {
    prop_oneof![
        1 => Just(FieldValue::Null),
        1 => any::<bool>().prop_map(FieldValue::Bool),
        2 => any::<i64>().prop_map(FieldValue::Integer),
        3 => "[A-Za-z0-9 ]{0,24}".prop_map(FieldValue::Text),
        2 => decimal_text_strategy().prop_map(FieldValue::Text),
    ]
}

/// Strategy for generating snapshots with up to `max_fields` fields.
pub fn snapshot_strategy(max_fields: usize) -> impl Strategy<Value = Snapshot> {
    prop::collection::btree_map(field_name_strategy(), field_value_strategy(), 0..=max_fields)
        .prop_map(Snapshot::from)
}

/// Strategy for generating site codes other than the hub's.
pub fn branch_code_strategy() -> impl Strategy<Value = SiteCode> {
    prop_oneof![
        Just(SiteCode::Norte),
        Just(SiteCode::Sur),
        Just(SiteCode::Oriente),
        Just(SiteCode::Occidente),
    ]
}

/// Strategy for generating the versions of one record: `Some` is a save,
/// `None` a delete.
pub fn entity_history_strategy(max_len: usize) -> impl Strategy<Value = Vec<Option<Snapshot>>> {
    prop::collection::vec(
        prop_oneof![
            4 => snapshot_strategy(4).prop_map(Some),
            1 => Just(None),
        ],
        1..=max_len.max(1),
    )
}

/// One edit to a patient in a generated script.
#[derive(Debug, Clone, PartialEq)]
pub enum PatientEdit {
    /// Save the patient with these fields.
    Save {
        /// Full name.
        name: String,
        /// Contact phone.
        phone: String,
        /// Balance as decimal text.
        balance: String,
    },
    /// Delete the patient.
    Delete,
}

/// Strategy for generating a patient edit.
pub fn patient_edit_strategy() -> impl Strategy<Value = PatientEdit> {
    prop_oneof![
        4 => ("[A-Z][a-z]{2,10}", "555-[0-9]{4}", decimal_text_strategy())
            .prop_map(|(name, phone, balance)| PatientEdit::Save { name, phone, balance }),
        1 => Just(PatientEdit::Delete),
    ]
}

/// Strategy for generating an edit script over `sites` sites and
/// `patients` patients per site.
///
/// Each step is `(site index, patient index, edit)`.
pub fn edit_script_strategy(
    sites: usize,
    patients: usize,
    max_steps: usize,
) -> impl Strategy<Value = Vec<(usize, usize, PatientEdit)>> {
    prop::collection::vec(
        (0..sites.max(1), 0..patients.max(1), patient_edit_strategy()),
        0..max_steps,
    )
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 64,
            max_shrink_iters: 500,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 16,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
