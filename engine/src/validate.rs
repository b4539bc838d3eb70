//! Pure validation of captured records.
//!
//! Validation runs twice per record: once at capture time, before the record
//! is allowed into the outbox, and once more at the store boundary, because
//! transports are not trusted. Hard failures are [`Error`]s and the record is
//! never enqueued; soft findings (a poor GPS fix) become [`ValidationFlag`]s
//! on an otherwise accepted record.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record::{RecordPayload, SyncableRecord};

/// Default ceiling for the reported GPS accuracy radius, in meters.
pub const DEFAULT_MAX_ACCURACY_M: f64 = 100.0;

/// Tenant-configurable validation ceilings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationLimits {
    /// GPS accuracy radius above which a visit is flagged, in meters
    pub max_accuracy_m: f64,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_accuracy_m: DEFAULT_MAX_ACCURACY_M,
        }
    }
}

/// Non-fatal findings attached to an accepted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValidationFlag {
    /// The GPS accuracy radius exceeded the tenant ceiling
    LowLocationConfidence,
}

/// Outcome of validating a record that was not rejected outright.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub flags: Vec<ValidationFlag>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn has(&self, flag: ValidationFlag) -> bool {
        self.flags.contains(&flag)
    }
}

/// Validate a record against tenant limits.
///
/// Deterministic and side-effect free. Field names in errors use the wire
/// spelling so they can be surfaced to the capture UI as-is.
pub fn validate(record: &SyncableRecord, limits: &ValidationLimits) -> Result<ValidationReport> {
    if record.record_id.is_empty() {
        return Err(Error::MissingIdentifier("recordId"));
    }
    if record.tenant_id.is_empty() {
        return Err(Error::MissingIdentifier("tenantId"));
    }
    if record.device_id.is_empty() {
        return Err(Error::MissingIdentifier("deviceId"));
    }
    if record.version == 0 {
        return Err(Error::InvalidVersion {
            record_id: record.record_id.clone(),
            version: 0,
        });
    }

    let mut report = ValidationReport::default();

    match &record.payload {
        RecordPayload::Visit {
            outlet_id,
            latitude,
            longitude,
            accuracy_m,
        } => {
            if outlet_id.is_empty() {
                return Err(Error::MissingIdentifier("outletId"));
            }
            if !latitude.is_finite() || !(-90.0..=90.0).contains(latitude) {
                return Err(Error::InvalidValue {
                    field: "latitude",
                    reason: format!("{latitude} is outside [-90, 90]"),
                });
            }
            if !longitude.is_finite() || !(-180.0..=180.0).contains(longitude) {
                return Err(Error::InvalidValue {
                    field: "longitude",
                    reason: format!("{longitude} is outside [-180, 180]"),
                });
            }
            if !accuracy_m.is_finite() || *accuracy_m < 0.0 {
                return Err(Error::InvalidValue {
                    field: "accuracyM",
                    reason: format!("{accuracy_m} is not a valid radius"),
                });
            }
            if *accuracy_m > limits.max_accuracy_m {
                report.flags.push(ValidationFlag::LowLocationConfidence);
            }
        }
        RecordPayload::StockMovement {
            warehouse_id,
            product_id,
            quantity_delta,
            ..
        } => {
            if warehouse_id.is_empty() {
                return Err(Error::MissingIdentifier("warehouseId"));
            }
            if product_id.is_empty() {
                return Err(Error::MissingIdentifier("productId"));
            }
            if !quantity_delta.is_finite() {
                return Err(Error::InvalidValue {
                    field: "quantityDelta",
                    reason: format!("{quantity_delta} is not a finite quantity"),
                });
            }
        }
        RecordPayload::CashReconciliation {
            period_id,
            counted_minor,
            expected_minor,
            currency,
        } => {
            if period_id.is_empty() {
                return Err(Error::MissingIdentifier("periodId"));
            }
            if *counted_minor < 0 {
                return Err(Error::InvalidValue {
                    field: "countedMinor",
                    reason: format!("{counted_minor} is negative"),
                });
            }
            if *expected_minor < 0 {
                return Err(Error::InvalidValue {
                    field: "expectedMinor",
                    reason: format!("{expected_minor} is negative"),
                });
            }
            if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
                return Err(Error::InvalidValue {
                    field: "currency",
                    reason: format!("'{currency}' is not an ISO 4217 code"),
                });
            }
        }
    }

    Ok(report)
}
