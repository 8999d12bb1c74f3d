use serde::{Deserialize, Serialize};

use fieldstock_catalog::LocationId;
use fieldstock_core::{AggregateId, DomainError, JobId};

fieldstock_core::aggregate_id!(
    /// Identifier of one ledger entry.
    MovementId
);

/// Kind of ledger entry. Quantities are always positive; the endpoints give direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    Receipt,
    Transfer,
    Installation,
    Return,
    Adjustment,
    Disposal,
}

impl MovementType {
    pub fn as_str(self) -> &'static str {
        match self {
            MovementType::Receipt => "receipt",
            MovementType::Transfer => "transfer",
            MovementType::Installation => "installation",
            MovementType::Return => "return",
            MovementType::Adjustment => "adjustment",
            MovementType::Disposal => "disposal",
        }
    }

    /// Validate which endpoints a movement of this type may carry.
    ///
    /// | type | from | to |
    /// |---|---|---|
    /// | receipt | none | required |
    /// | transfer | required | required, other location |
    /// | installation, disposal | required | none |
    /// | return | optional job reservation at the same location | required, unreserved |
    /// | adjustment | exactly one of from/to | |
    pub fn check_endpoints(
        self,
        from: Option<&StockBucket>,
        to: Option<&StockBucket>,
    ) -> Result<(), DomainError> {
        let name = self.as_str();
        match self {
            MovementType::Receipt => match (from, to) {
                (None, Some(_)) => Ok(()),
                (Some(_), _) => Err(DomainError::validation("receipt cannot have a source location")),
                (None, None) => Err(DomainError::validation("receipt requires a destination location")),
            },
            MovementType::Transfer => match (from, to) {
                (Some(f), Some(t)) if f.location == t.location => Err(DomainError::validation(
                    "transfer source and destination must be different locations",
                )),
                (Some(_), Some(_)) => Ok(()),
                _ => Err(DomainError::validation(
                    "transfer requires both a source and a destination location",
                )),
            },
            MovementType::Installation | MovementType::Disposal => match (from, to) {
                (Some(_), None) => Ok(()),
                (None, _) => Err(DomainError::validation(format!(
                    "{name} requires a source location"
                ))),
                (Some(_), Some(_)) => Err(DomainError::validation(format!(
                    "{name} cannot have a destination location"
                ))),
            },
            MovementType::Return => match (from, to) {
                (_, None) => Err(DomainError::validation("return requires a destination location")),
                (_, Some(t)) if t.reserved_for.is_some() => Err(DomainError::validation(
                    "return destination must be general stock",
                )),
                (None, Some(_)) => Ok(()),
                (Some(f), Some(t)) if f.reserved_for.is_some() && f.location == t.location => Ok(()),
                (Some(_), Some(_)) => Err(DomainError::validation(
                    "return source must be a job reservation at the destination location",
                )),
            },
            MovementType::Adjustment => match (from, to) {
                (Some(_), None) | (None, Some(_)) => Ok(()),
                _ => Err(DomainError::validation(
                    "adjustment requires exactly one of source or destination",
                )),
            },
        }
    }
}

impl core::str::FromStr for MovementType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "receipt" => Ok(MovementType::Receipt),
            "transfer" => Ok(MovementType::Transfer),
            "installation" => Ok(MovementType::Installation),
            "return" => Ok(MovementType::Return),
            "adjustment" => Ok(MovementType::Adjustment),
            "disposal" => Ok(MovementType::Disposal),
            other => Err(DomainError::validation(format!("unknown movement_type '{other}'"))),
        }
    }
}

impl core::fmt::Display for MovementType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where stock sits: a location, optionally reserved for one job.
///
/// General stock (`reserved_for = None`) is what `quantity_at` reports. Job-linked
/// receipts land in a reserved bucket at the staging location until picked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockBucket {
    pub location: LocationId,
    pub reserved_for: Option<JobId>,
}

impl StockBucket {
    pub fn general(location: LocationId) -> Self {
        Self {
            location,
            reserved_for: None,
        }
    }

    pub fn reserved(location: LocationId, job_id: JobId) -> Self {
        Self {
            location,
            reserved_for: Some(job_id),
        }
    }

    pub fn for_job(location: LocationId, job_id: Option<JobId>) -> Self {
        Self {
            location,
            reserved_for: job_id,
        }
    }
}

impl core::fmt::Display for StockBucket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.reserved_for {
            Some(job) => write!(f, "location {} (reserved for job {job})", self.location),
            None => write!(f, "location {}", self.location),
        }
    }
}

/// What caused a movement, for audit and billing lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MovementReference {
    PurchaseOrderLine {
        order_id: AggregateId,
        order_number: String,
        line_no: u32,
    },
    Unit {
        unit_id: AggregateId,
    },
    Job {
        job_id: JobId,
    },
}
