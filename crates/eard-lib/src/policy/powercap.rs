//! Powercap domains and per-application caps

use serde::{Deserialize, Serialize};

use crate::error::{EardError, Result};

/// Quantity a cap applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowercapDomain {
    /// Joules per accounting window
    Energy,
    /// Watts
    Power,
}

impl PowercapDomain {
    pub const ALL: [PowercapDomain; 2] = [PowercapDomain::Energy, PowercapDomain::Power];

    pub fn as_str(&self) -> &'static str {
        match self {
            PowercapDomain::Energy => "energy",
            PowercapDomain::Power => "power",
        }
    }
}

impl TryFrom<u32> for PowercapDomain {
    type Error = EardError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(PowercapDomain::Energy),
            1 => Ok(PowercapDomain::Power),
            other => Err(EardError::invalid(format!("unknown powercap domain {}", other))),
        }
    }
}

impl From<PowercapDomain> for u32 {
    fn from(domain: PowercapDomain) -> u32 {
        match domain {
            PowercapDomain::Energy => 0,
            PowercapDomain::Power => 1,
        }
    }
}

impl std::fmt::Display for PowercapDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caps enforced for one application, unset meaning no cap
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Powercap {
    pub energy_j: Option<f64>,
    pub power_w: Option<f64>,
}

impl Powercap {
    pub fn get(&self, domain: PowercapDomain) -> Option<f64> {
        match domain {
            PowercapDomain::Energy => self.energy_j,
            PowercapDomain::Power => self.power_w,
        }
    }

    pub fn set(&mut self, domain: PowercapDomain, limit: f64) {
        match domain {
            PowercapDomain::Energy => self.energy_j = Some(limit),
            PowercapDomain::Power => self.power_w = Some(limit),
        }
    }
}

/// Raw powercap request as received on the wire
///
/// The domain stays a number until validated so that an unknown value is
/// rejected as an invalid argument rather than a decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowercapRequest {
    pub pid: u32,
    pub domain: u32,
    pub limit: f64,
}

impl PowercapRequest {
    pub fn new(pid: u32, domain: PowercapDomain, limit: f64) -> Self {
        Self {
            pid,
            domain: domain.into(),
            limit,
        }
    }

    /// Check domain and limit without touching any state
    pub fn validate(&self) -> Result<(PowercapDomain, f64)> {
        let domain = PowercapDomain::try_from(self.domain)?;
        if !self.limit.is_finite() || self.limit <= 0.0 {
            return Err(EardError::invalid(format!(
                "powercap limit must be positive, got {}",
                self.limit
            )));
        }
        Ok((domain, self.limit))
    }
}

/// Tightest of the given limits
pub fn effective_limit(limits: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    limits.into_iter().flatten().reduce(f64::min)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_from_u32() {
        assert_eq!(PowercapDomain::try_from(0).unwrap(), PowercapDomain::Energy);
        assert_eq!(PowercapDomain::try_from(1).unwrap(), PowercapDomain::Power);
        assert!(matches!(
            PowercapDomain::try_from(7),
            Err(EardError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_request_validation() {
        assert!(PowercapRequest::new(1, PowercapDomain::Power, 250.0).validate().is_ok());

        let bad_domain = PowercapRequest {
            pid: 1,
            domain: 9,
            limit: 250.0,
        };
        assert!(bad_domain.validate().is_err());

        assert!(PowercapRequest::new(1, PowercapDomain::Energy, 0.0).validate().is_err());
        assert!(PowercapRequest::new(1, PowercapDomain::Energy, f64::NAN).validate().is_err());
    }

    #[test]
    fn test_effective_limit() {
        assert_eq!(effective_limit([None, Some(300.0), Some(250.0)]), Some(250.0));
        assert_eq!(effective_limit([None, None]), None);
    }

    #[test]
    fn test_powercap_get_set() {
        let mut cap = Powercap::default();
        cap.set(PowercapDomain::Power, 180.0);
        assert_eq!(cap.get(PowercapDomain::Power), Some(180.0));
        assert_eq!(cap.get(PowercapDomain::Energy), None);
    }
}
