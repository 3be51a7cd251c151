//! Inclusion Matchers
//!
//! Predicates that compare a device against a volume set's
//! `DeviceInclusionSpec`. Unlike filters they depend on configuration, and
//! they only run for devices that already cleared the age gate.

use super::filters::FilterVerdict;
use crate::crd::{DeviceInclusionSpec, DeviceMechanicalProperty, DeviceType};
use crate::error::{Error, Result};
use crate::hardware::discovery::BlockDevice;
use tracing::{error, info};

// =============================================================================
// Matcher Names
// =============================================================================

pub const IN_TYPE_LIST: &str = "inTypeList";
pub const IN_SIZE_RANGE: &str = "inSizeRange";
pub const IN_DEVICE_MECHANICAL_PROPERTY: &str = "inDeviceMechanicalProperty";
pub const IN_VENDOR_LIST: &str = "inVendorList";
pub const IN_MODEL_LIST: &str = "inModelList";

/// A named predicate over a device and the inclusion rules
pub trait DeviceMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn matches(&self, device: &BlockDevice, spec: &DeviceInclusionSpec) -> Result<bool>;
}

// =============================================================================
// Matchers
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct InTypeList;

impl DeviceMatcher for InTypeList {
    fn name(&self) -> &'static str {
        IN_TYPE_LIST
    }

    fn matches(&self, device: &BlockDevice, spec: &DeviceInclusionSpec) -> Result<bool> {
        Ok(match DeviceType::parse(&device.device_type) {
            Some(device_type) => spec.effective_device_types().contains(&device_type),
            None => false,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InSizeRange;

impl DeviceMatcher for InSizeRange {
    fn name(&self) -> &'static str {
        IN_SIZE_RANGE
    }

    fn matches(&self, device: &BlockDevice, spec: &DeviceInclusionSpec) -> Result<bool> {
        let min = spec.effective_min_size();
        if let Some(max) = spec.max_size {
            if max < min {
                return Err(Error::FilterEvaluation {
                    filter: IN_SIZE_RANGE.into(),
                    device: device.name.clone(),
                    reason: format!("maxSize {} is smaller than minSize {}", max, min),
                });
            }
            if device.size > max {
                return Ok(false);
            }
        }
        Ok(device.size >= min)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InDeviceMechanicalProperty;

impl DeviceMatcher for InDeviceMechanicalProperty {
    fn name(&self) -> &'static str {
        IN_DEVICE_MECHANICAL_PROPERTY
    }

    fn matches(&self, device: &BlockDevice, spec: &DeviceInclusionSpec) -> Result<bool> {
        if spec.device_mechanical_properties.is_empty() {
            return Ok(true);
        }
        let property = DeviceMechanicalProperty::from_rotational(device.rotational);
        Ok(spec.device_mechanical_properties.contains(&property))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InVendorList;

impl DeviceMatcher for InVendorList {
    fn name(&self) -> &'static str {
        IN_VENDOR_LIST
    }

    fn matches(&self, device: &BlockDevice, spec: &DeviceInclusionSpec) -> Result<bool> {
        Ok(contains_any(&device.vendor, &spec.vendors))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InModelList;

impl DeviceMatcher for InModelList {
    fn name(&self) -> &'static str {
        IN_MODEL_LIST
    }

    fn matches(&self, device: &BlockDevice, spec: &DeviceInclusionSpec) -> Result<bool> {
        Ok(contains_any(&device.model, &spec.models))
    }
}

/// Empty list matches everything
fn contains_any(value: &str, allowed: &[String]) -> bool {
    let value = value.trim();
    allowed.is_empty() || allowed.iter().any(|entry| value.contains(entry.trim()))
}

// =============================================================================
// Matcher Set
// =============================================================================

/// Ordered matchers applied after the age gate
pub struct MatcherSet {
    matchers: Vec<Box<dyn DeviceMatcher>>,
}

impl MatcherSet {
    pub fn new(matchers: Vec<Box<dyn DeviceMatcher>>) -> Self {
        Self { matchers }
    }

    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(InTypeList),
            Box::new(InSizeRange),
            Box::new(InDeviceMechanicalProperty),
            Box::new(InVendorList),
            Box::new(InModelList),
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.matchers.iter().map(|m| m.name()).collect()
    }

    /// Run every matcher until one rejects the device or fails
    pub fn evaluate(&self, device: &BlockDevice, spec: &DeviceInclusionSpec) -> FilterVerdict {
        for matcher in &self.matchers {
            match matcher.matches(device, spec) {
                Ok(true) => continue,
                Ok(false) => {
                    info!(device = %device.name, filter = matcher.name(), "match negative");
                    return FilterVerdict::Rejected { filter: matcher.name() };
                }
                Err(e) => {
                    error!(device = %device.name, filter = matcher.name(), error = %e, "match error");
                    return FilterVerdict::Failed {
                        filter: matcher.name(),
                        reason: e.to_string(),
                    };
                }
            }
        }
        FilterVerdict::Pass
    }
}

impl Default for MatcherSet {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for MatcherSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatcherSet")
            .field("matchers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const GI: u64 = 1024 * 1024 * 1024;

    fn disk(size: u64) -> BlockDevice {
        BlockDevice {
            name: "sdb".into(),
            kname: "sdb".into(),
            device_type: "disk".into(),
            size,
            model: "SSDSC2KB038TZR".into(),
            vendor: "ATA".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_in_type_list_defaults() {
        let spec = DeviceInclusionSpec::default();
        let mut dev = disk(10 * GI);
        assert!(InTypeList.matches(&dev, &spec).unwrap());

        dev.device_type = "mpath".into();
        assert!(InTypeList.matches(&dev, &spec).unwrap());

        dev.device_type = "part".into();
        assert!(!InTypeList.matches(&dev, &spec).unwrap());

        dev.device_type = "loop".into();
        assert!(!InTypeList.matches(&dev, &spec).unwrap());
    }

    #[test]
    fn test_in_type_list_explicit() {
        let spec = DeviceInclusionSpec {
            device_types: vec![DeviceType::Part],
            ..Default::default()
        };
        let mut dev = disk(10 * GI);
        assert!(!InTypeList.matches(&dev, &spec).unwrap());
        dev.device_type = "part".into();
        assert!(InTypeList.matches(&dev, &spec).unwrap());
    }

    #[test]
    fn test_in_size_range() {
        let spec = DeviceInclusionSpec::default();
        assert!(InSizeRange.matches(&disk(GI), &spec).unwrap());
        assert!(!InSizeRange.matches(&disk(GI - 1), &spec).unwrap());

        let spec = DeviceInclusionSpec {
            min_size: Some(5 * GI),
            max_size: Some(10 * GI),
            ..Default::default()
        };
        assert!(!InSizeRange.matches(&disk(4 * GI), &spec).unwrap());
        assert!(InSizeRange.matches(&disk(10 * GI), &spec).unwrap());
        assert!(!InSizeRange.matches(&disk(11 * GI), &spec).unwrap());
    }

    #[test]
    fn test_in_size_range_inverted_bounds() {
        let spec = DeviceInclusionSpec {
            min_size: Some(10 * GI),
            max_size: Some(GI),
            ..Default::default()
        };
        assert_matches!(
            InSizeRange.matches(&disk(5 * GI), &spec),
            Err(Error::FilterEvaluation { .. })
        );
    }

    #[test]
    fn test_in_mechanical_property() {
        let mut dev = disk(10 * GI);
        assert!(InDeviceMechanicalProperty
            .matches(&dev, &DeviceInclusionSpec::default())
            .unwrap());

        let spec = DeviceInclusionSpec {
            device_mechanical_properties: vec![DeviceMechanicalProperty::NonRotational],
            ..Default::default()
        };
        assert!(InDeviceMechanicalProperty.matches(&dev, &spec).unwrap());
        dev.rotational = true;
        assert!(!InDeviceMechanicalProperty.matches(&dev, &spec).unwrap());
    }

    #[test]
    fn test_vendor_and_model_substrings() {
        let dev = disk(10 * GI);
        let spec = DeviceInclusionSpec {
            vendors: vec!["ATA ".into()],
            models: vec!["SSDSC2KB".into()],
            ..Default::default()
        };
        assert!(InVendorList.matches(&dev, &spec).unwrap());
        assert!(InModelList.matches(&dev, &spec).unwrap());

        let spec = DeviceInclusionSpec {
            vendors: vec!["NVME".into()],
            models: vec!["MTFDDAK".into()],
            ..Default::default()
        };
        assert!(!InVendorList.matches(&dev, &spec).unwrap());
        assert!(!InModelList.matches(&dev, &spec).unwrap());
    }

    #[test]
    fn test_matcher_set() {
        let set = MatcherSet::standard();
        assert_eq!(set.evaluate(&disk(10 * GI), &DeviceInclusionSpec::default()), FilterVerdict::Pass);
        assert_eq!(
            set.evaluate(&disk(GI / 2), &DeviceInclusionSpec::default()),
            FilterVerdict::Rejected { filter: IN_SIZE_RANGE }
        );
        assert_eq!(set.names().len(), 5);
    }
}
