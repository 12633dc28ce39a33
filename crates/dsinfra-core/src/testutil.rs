//! Shared fixtures for unit tests.

use crate::config::{validate, RawDeployment, ValidatedConfig};

/// Three GCP datasets. `datasets` is the last key so snippets can be appended.
pub const DEPLOYMENT: &str = r#"infrastructure:
  domain: example.org
  budget_currency: AUD
  gcp:
    region: australia-southeast1
    groups_domain: example.org
    dataset_storage_prefix: cpg-
    billing_account: 01ABCD-000000-000000
  service_accounts:
    analysis_runner: analysis-runner@analysis.iam.gserviceaccount.com
    access_group_cache: group-cache@analysis.iam.gserviceaccount.com
    cromwell_runner: cromwell-runner@analysis.iam.gserviceaccount.com
    analysis_runner_logger: runner-logger@analysis.iam.gserviceaccount.com
  users:
    alice:
      clouds:
        gcp: { id: alice@example.org, hail_batch_username: alice }
    bob:
      clouds:
        gcp: { id: bob@example.org }
  can_access_internal_dataset_logs: [bob]
datasets:
  - name: common
    components: { gcp: [] }
  - name: fewgenomes
    archive_age: 30
    components: { gcp: [] }
  - name: thousand-genomes
    depends_on: [fewgenomes]
    budgets:
      gcp: { monthly_budget: 100 }
"#;

pub const MEMBERS: &str = "fewgenomes:\n  access: [alice]\n";

const AZURE_DEPLOYMENT: &str = r#"infrastructure:
  domain: example.org
  budget_currency: AUD
  gcp:
    region: australia-southeast1
    groups_domain: example.org
    dataset_storage_prefix: cpg-
  azure:
    region: australiaeast
    subscription: 00000000-0000-0000-0000-000000000001
    tenant: 00000000-0000-0000-0000-000000000002
    dataset_storage_prefix: cpg-
datasets:
  - name: common
    deploy_locations: [gcp, azure]
    components: { gcp: [], azure: [] }
  - name: fewgenomes
    deploy_locations: [gcp, azure]
"#;

pub fn raw(yaml: &str) -> RawDeployment {
    RawDeployment::parse(yaml).unwrap()
}

pub fn config() -> ValidatedConfig {
    validate(raw(DEPLOYMENT)).unwrap()
}

pub fn azure_config() -> ValidatedConfig {
    validate(raw(AZURE_DEPLOYMENT)).unwrap()
}

/// A dataset named `hailed` with batch identities at every level and the
/// given GCP components.
pub fn hailed_dataset(components: &str) -> String {
    format!(
        "  - name: hailed\n    components: {{ gcp: [{components}] }}\n    gcp:\n      hail_accounts:\n        test: {{ username: hailed-test, cloud_id: hailed-test@hail.iam.gserviceaccount.com }}\n        standard: {{ username: hailed-standard, cloud_id: hailed-standard@hail.iam.gserviceaccount.com }}\n        full: {{ username: hailed-full, cloud_id: hailed-full@hail.iam.gserviceaccount.com }}\n"
    )
}

/// [`DEPLOYMENT`] plus extra dataset entries, indented as list items.
pub fn config_with_dataset(snippet: &str) -> ValidatedConfig {
    validate(raw(&format!("{DEPLOYMENT}{snippet}"))).unwrap()
}
