use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tradeflow::jobs::{
    ItemContext, ItemOutcome, JobType, Processor, ProcessorConfig, ProcessorOptions,
    ProcessorRegistry,
};
use tradeflow::ItemError;

// Demo processors. Real deployments register their own business logic per job type.

fn field<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Lets operators exercise retry paths from a manifest: `"simulate": "timeout"` etc.
fn simulated_failure(payload: &Value) -> Option<ItemError> {
    match field(payload, "simulate")? {
        "timeout" => Some(ItemError::timeout("simulated timeout")),
        "dependency_down" => Some(ItemError::from_code("DEPENDENCY_DOWN", "simulated outage")),
        "rate_limit" => Some(ItemError::from_code("RATE_LIMIT", "simulated 429")),
        "reject" => Some(ItemError::processing("simulated business rejection")),
        "flaky" => Some(ItemError::processing("simulated transient rejection").transient()),
        _ => None,
    }
}

// ----------------------------
// document_validation
// ----------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentValidationConfig {
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub max_size_bytes: Option<u64>,
}

impl ProcessorConfig for DocumentValidationConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_size_bytes == Some(0) {
            return Err("max_size_bytes must be positive".into());
        }
        Ok(())
    }
}

pub struct DocumentValidation;

#[async_trait]
impl Processor for DocumentValidation {
    type Config = DocumentValidationConfig;

    fn job_type(&self) -> JobType {
        JobType::DocumentValidation
    }

    async fn execute(
        &self,
        config: &DocumentValidationConfig,
        _ctx: &ItemContext,
        payload: &Value,
    ) -> Result<ItemOutcome, ItemError> {
        if let Some(err) = simulated_failure(payload) {
            return Err(err);
        }

        let missing: Vec<&str> = config
            .required_fields
            .iter()
            .map(String::as_str)
            .filter(|f| payload.get(*f).map_or(true, Value::is_null))
            .collect();
        if !missing.is_empty() {
            return Err(ItemError::validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        if let (Some(max), Some(size)) = (
            config.max_size_bytes,
            payload.get("size_bytes").and_then(Value::as_u64),
        ) {
            if size > max {
                return Err(ItemError::validation(format!(
                    "document is {size} bytes, limit is {max}"
                )));
            }
        }

        Ok(ItemOutcome::Completed(json!({
            "valid": true,
            "checked_fields": config.required_fields.len(),
        })))
    }
}

// ----------------------------
// sanctions_screening
// ----------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct SanctionsScreeningConfig {
    pub lists: Vec<String>,
    #[serde(default)]
    pub blocked_parties: Vec<String>,
}

impl ProcessorConfig for SanctionsScreeningConfig {
    fn validate(&self) -> Result<(), String> {
        if self.lists.is_empty() {
            return Err("at least one screening list is required".into());
        }
        Ok(())
    }
}

pub struct SanctionsScreening;

#[async_trait]
impl Processor for SanctionsScreening {
    type Config = SanctionsScreeningConfig;

    fn job_type(&self) -> JobType {
        JobType::SanctionsScreening
    }

    async fn execute(
        &self,
        config: &SanctionsScreeningConfig,
        _ctx: &ItemContext,
        payload: &Value,
    ) -> Result<ItemOutcome, ItemError> {
        if let Some(err) = simulated_failure(payload) {
            return Err(err);
        }

        let Some(party) = field(payload, "party").or_else(|| field(payload, "consignee")) else {
            return Ok(ItemOutcome::Skipped("no party to screen".into()));
        };

        let party_lc = party.to_lowercase();
        let hit = config
            .blocked_parties
            .iter()
            .find(|b| party_lc.contains(&b.to_lowercase()));

        if let Some(blocked) = hit {
            return Err(ItemError::processing(format!(
                "party {party:?} matches blocked entry {blocked:?}"
            )));
        }

        Ok(ItemOutcome::Completed(json!({
            "party": party,
            "lists": config.lists,
            "hit": false,
        })))
    }
}

// ----------------------------
// hs_classification
// ----------------------------

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct HsClassificationConfig {
    #[serde(default)]
    pub default_chapter: Option<String>,
}

impl ProcessorConfig for HsClassificationConfig {
    fn validate(&self) -> Result<(), String> {
        match &self.default_chapter {
            Some(ch) if ch.len() != 2 || !ch.chars().all(|c| c.is_ascii_digit()) => {
                Err(format!("default_chapter must be two digits, got {ch:?}"))
            }
            _ => Ok(()),
        }
    }
}

pub struct HsClassification;

#[async_trait]
impl Processor for HsClassification {
    type Config = HsClassificationConfig;

    fn job_type(&self) -> JobType {
        JobType::HsClassification
    }

    async fn execute(
        &self,
        config: &HsClassificationConfig,
        _ctx: &ItemContext,
        payload: &Value,
    ) -> Result<ItemOutcome, ItemError> {
        if let Some(err) = simulated_failure(payload) {
            return Err(err);
        }

        if let Some(code) = field(payload, "hs_code") {
            let digits: String = code.chars().filter(char::is_ascii_digit).collect();
            if digits.len() < 6 {
                return Err(ItemError::validation(format!(
                    "hs_code {code:?} needs at least 6 digits"
                )));
            }
            return Ok(ItemOutcome::Completed(json!({
                "hs_code": digits,
                "chapter": &digits[..2],
                "source": "declared",
            })));
        }

        match &config.default_chapter {
            Some(chapter) if field(payload, "description").is_some() => {
                Ok(ItemOutcome::Completed(json!({
                    "chapter": chapter,
                    "source": "default",
                })))
            }
            _ => Ok(ItemOutcome::Skipped("nothing to classify".into())),
        }
    }
}

// ----------------------------
// certificate_verification
// ----------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct CertificateVerificationConfig {
    pub trusted_issuers: Vec<String>,
}

impl ProcessorConfig for CertificateVerificationConfig {
    fn validate(&self) -> Result<(), String> {
        if self.trusted_issuers.is_empty() {
            return Err("trusted_issuers must not be empty".into());
        }
        Ok(())
    }
}

pub struct CertificateVerification;

#[async_trait]
impl Processor for CertificateVerification {
    type Config = CertificateVerificationConfig;

    fn job_type(&self) -> JobType {
        JobType::CertificateVerification
    }

    async fn execute(
        &self,
        config: &CertificateVerificationConfig,
        ctx: &ItemContext,
        payload: &Value,
    ) -> Result<ItemOutcome, ItemError> {
        if let Some(err) = simulated_failure(payload) {
            return Err(err);
        }

        let issuer = field(payload, "issuer")
            .ok_or_else(|| ItemError::validation("certificate has no issuer"))?;

        if !config.trusted_issuers.iter().any(|t| t.eq_ignore_ascii_case(issuer)) {
            return Err(ItemError::processing(format!("issuer {issuer:?} is not trusted")));
        }

        Ok(ItemOutcome::Completed(json!({
            "issuer": issuer,
            "verified": true,
            "verification_ref": ctx.idempotency_key,
        })))
    }
}

pub fn build_registry(default_timeout: Duration) -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::new().with_default_timeout(default_timeout);

    registry.register(DocumentValidation);
    registry.register_with_options(
        SanctionsScreening,
        ProcessorOptions::new().max_concurrency(20),
    );
    registry.register(HsClassification);
    registry.register_with_options(
        CertificateVerification,
        ProcessorOptions::new()
            .max_concurrency(10)
            .timeout(Duration::from_secs(30)),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ctx() -> ItemContext {
        ItemContext {
            job_id: Uuid::new_v4(),
            item_id: Uuid::new_v4(),
            external_id: "X-1".into(),
            idempotency_key: "key-1".into(),
            attempt: 1,
        }
    }

    #[test]
    fn every_job_type_has_a_processor() {
        let registry = build_registry(Duration::from_secs(5));
        for job_type in JobType::ALL {
            assert!(registry.contains(job_type), "{job_type} not registered");
        }
    }

    #[test]
    fn sanctions_config_requires_a_list() {
        let registry = build_registry(Duration::from_secs(5));
        assert!(registry
            .validate_config(JobType::SanctionsScreening, &json!({ "lists": [] }))
            .is_err());
        assert!(registry
            .validate_config(JobType::SanctionsScreening, &json!({ "lists": ["ofac"] }))
            .is_ok());
    }

    #[tokio::test]
    async fn hs_classification_skips_empty_records() {
        let registry = build_registry(Duration::from_secs(5));
        let bound = registry.bind(JobType::HsClassification, &json!({})).unwrap();

        let out = bound.run(&ctx(), &json!({ "external_id": "X-1" })).await.unwrap();
        assert!(matches!(out, ItemOutcome::Skipped(_)));

        let out = bound
            .run(&ctx(), &json!({ "hs_code": "8471.30" }))
            .await
            .unwrap();
        assert_eq!(
            out,
            ItemOutcome::Completed(json!({ "hs_code": "847130", "chapter": "84", "source": "declared" }))
        );
    }

    #[tokio::test]
    async fn simulated_timeout_is_retriable_network_error() {
        let registry = build_registry(Duration::from_secs(5));
        let bound = registry
            .bind(JobType::DocumentValidation, &Value::Null)
            .unwrap();
        let err = bound
            .run(&ctx(), &json!({ "simulate": "timeout" }))
            .await
            .unwrap_err();
        assert_eq!(err.code, "TIMEOUT");
        assert_eq!(err.category, tradeflow::ErrorCategory::Network);
    }
}
