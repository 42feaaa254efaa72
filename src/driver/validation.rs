//! Request validation shared by the controller RPCs.

use crate::csi::volume_capability::access_mode::Mode;
use crate::csi::volume_capability::AccessType;
use crate::csi::{CapacityRange, TopologyRequirement, VolumeCapability};
use crate::volume::GIB;

use super::TOPOLOGY_LOCATION_KEY;
use super::status::RequestError;

/// Smallest volume the provider creates.
pub(crate) const MIN_VOLUME_SIZE: u64 = 10 * GIB;
/// Largest volume the provider creates.
pub(crate) const MAX_VOLUME_SIZE: u64 = 10 * 1024 * GIB;
/// Size used when the request states no capacity.
pub(crate) const DEFAULT_VOLUME_SIZE: u64 = MIN_VOLUME_SIZE;

const SUPPORTED_MODES: [Mode; 3] = [
    Mode::SingleNodeWriter,
    Mode::SingleNodeSingleWriter,
    Mode::SingleNodeMultiWriter,
];

/// Size chosen for a request together with its upper bound.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct SizeRange {
    pub(crate) size_bytes: u64,
    pub(crate) limit_bytes: Option<u64>,
}

fn non_negative(value: i64, field: &str) -> Result<u64, RequestError> {
    u64::try_from(value)
        .map_err(|_| RequestError::InvalidArgument(format!("{field} must not be negative")))
}

const fn round_up_to_gib(bytes: u64) -> u64 {
    bytes.div_ceil(GIB).saturating_mul(GIB)
}

/// Derives the provisioned size from a capacity range.
///
/// The required size defaults to [`DEFAULT_VOLUME_SIZE`], is rounded up to
/// whole GiB and raised to [`MIN_VOLUME_SIZE`].
pub(crate) fn size_range(range: Option<&CapacityRange>) -> Result<SizeRange, RequestError> {
    let (required, limit) = match range {
        Some(capacity) => (
            non_negative(capacity.required_bytes, "required_bytes")?,
            non_negative(capacity.limit_bytes, "limit_bytes")?,
        ),
        None => (0, 0),
    };
    let limit_bytes = (limit > 0).then_some(limit);

    if let Some(bound) = limit_bytes {
        if bound < MIN_VOLUME_SIZE {
            return Err(RequestError::OutOfRange(format!(
                "limit of {bound} bytes is below the minimum volume size of {MIN_VOLUME_SIZE} bytes"
            )));
        }
        if required > bound {
            return Err(RequestError::OutOfRange(format!(
                "required {required} bytes exceeds the limit of {bound} bytes"
            )));
        }
    }
    if required > MAX_VOLUME_SIZE {
        return Err(RequestError::OutOfRange(format!(
            "required {required} bytes exceeds the maximum volume size of {MAX_VOLUME_SIZE} bytes"
        )));
    }

    let wanted = if required == 0 {
        DEFAULT_VOLUME_SIZE
    } else {
        required
    };
    let size_bytes = round_up_to_gib(wanted).max(MIN_VOLUME_SIZE);
    if limit_bytes.is_some_and(|bound| size_bytes > bound) {
        return Err(RequestError::OutOfRange(format!(
            "no whole GiB size of at least {wanted} bytes fits the limit"
        )));
    }
    Ok(SizeRange {
        size_bytes,
        limit_bytes,
    })
}

/// Derives the target size for an expansion request.
pub(crate) fn expansion_size(range: Option<&CapacityRange>) -> Result<u64, RequestError> {
    let capacity = range.ok_or_else(|| RequestError::missing("capacity range"))?;
    let required = non_negative(capacity.required_bytes, "required_bytes")?;
    let limit = non_negative(capacity.limit_bytes, "limit_bytes")?;

    let size_bytes = round_up_to_gib(required).max(MIN_VOLUME_SIZE);
    if size_bytes > MAX_VOLUME_SIZE {
        return Err(RequestError::OutOfRange(format!(
            "required {required} bytes exceeds the maximum volume size of {MAX_VOLUME_SIZE} bytes"
        )));
    }
    if limit > 0 && size_bytes > limit {
        return Err(RequestError::OutOfRange(format!(
            "required {required} bytes exceeds the limit of {limit} bytes"
        )));
    }
    Ok(size_bytes)
}

/// Returns `true` for single-node writer modes with mount or block access.
pub(crate) fn is_supported(capability: &VolumeCapability) -> bool {
    let has_access_type = matches!(
        capability.access_type,
        Some(AccessType::Block(_) | AccessType::Mount(_))
    );
    let mode_supported = capability
        .access_mode
        .as_ref()
        .is_some_and(|access| SUPPORTED_MODES.contains(&access.mode()));
    has_access_type && mode_supported
}

/// Rejects an empty capability list or any unsupported capability.
pub(crate) fn check_capabilities(capabilities: &[VolumeCapability]) -> Result<(), RequestError> {
    if capabilities.is_empty() {
        return Err(RequestError::missing("volume capabilities"));
    }
    if capabilities.iter().all(is_supported) {
        return Ok(());
    }
    Err(RequestError::InvalidArgument(String::from(
        "volume capabilities not supported: only single node writer access is available",
    )))
}

/// Location requested by topology, preferred segments first.
pub(crate) fn requested_location(requirement: Option<&TopologyRequirement>) -> Option<String> {
    let topology = requirement?;
    topology
        .preferred
        .iter()
        .chain(topology.requisite.iter())
        .find_map(|entry| entry.segments.get(TOPOLOGY_LOCATION_KEY))
        .map(|location| location.trim().to_owned())
        .filter(|location| !location.is_empty())
}

/// Parses a numeric provider id, reporting anything else as not found.
pub(crate) fn parse_id(value: &str, kind: &str) -> Result<u64, RequestError> {
    value
        .trim()
        .parse()
        .map_err(|_| RequestError::NotFound(format!("{kind} {value} not found")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;
    use crate::csi::Topology;
    use crate::csi::volume_capability::{AccessMode, BlockVolume, MountVolume};

    fn capability(mode: Mode, access: Option<AccessType>) -> VolumeCapability {
        VolumeCapability {
            access_type: access,
            access_mode: Some(AccessMode {
                mode: i32::from(mode),
            }),
        }
    }

    fn range(required: u64, limit: u64) -> CapacityRange {
        CapacityRange {
            required_bytes: i64::try_from(required).unwrap_or(i64::MAX),
            limit_bytes: i64::try_from(limit).unwrap_or(i64::MAX),
        }
    }

    fn topology(location: &str) -> Topology {
        Topology {
            segments: HashMap::from([(TOPOLOGY_LOCATION_KEY.to_owned(), location.to_owned())]),
        }
    }

    #[rstest]
    #[case(None, 10 * GIB)]
    #[case(Some(range(0, 0)), 10 * GIB)]
    #[case(Some(range(GIB, 0)), 10 * GIB)]
    #[case(Some(range(15 * GIB + 1, 0)), 16 * GIB)]
    #[case(Some(range(20 * GIB, 20 * GIB)), 20 * GIB)]
    fn size_is_rounded_and_raised(#[case] capacity: Option<CapacityRange>, #[case] expected: u64) {
        let derived = size_range(capacity.as_ref()).expect("valid range");
        assert_eq!(derived.size_bytes, expected);
    }

    #[rstest]
    #[case(range(0, 5 * GIB))]
    #[case(range(20 * GIB, 15 * GIB))]
    #[case(range(MAX_VOLUME_SIZE + 1, 0))]
    #[case(range(15 * GIB + 1, 15 * GIB + 2))]
    fn impossible_ranges_are_out_of_range(#[case] capacity: CapacityRange) {
        assert!(matches!(
            size_range(Some(&capacity)),
            Err(RequestError::OutOfRange(_))
        ));
    }

    #[test]
    fn negative_capacity_is_invalid() {
        let capacity = CapacityRange {
            required_bytes: -1,
            limit_bytes: 0,
        };
        assert!(matches!(
            size_range(Some(&capacity)),
            Err(RequestError::InvalidArgument(_))
        ));
    }

    #[test]
    fn expansion_requires_a_range() {
        assert!(matches!(
            expansion_size(None),
            Err(RequestError::InvalidArgument(_))
        ));
        assert_eq!(expansion_size(Some(&range(30 * GIB, 0))), Ok(30 * GIB));
    }

    #[rstest]
    #[case(Mode::SingleNodeWriter, Some(AccessType::Mount(MountVolume::default())), true)]
    #[case(Mode::SingleNodeMultiWriter, Some(AccessType::Block(BlockVolume {})), true)]
    #[case(Mode::MultiNodeMultiWriter, Some(AccessType::Mount(MountVolume::default())), false)]
    #[case(Mode::SingleNodeReaderOnly, Some(AccessType::Block(BlockVolume {})), false)]
    #[case(Mode::SingleNodeWriter, None, false)]
    fn capability_support(
        #[case] mode: Mode,
        #[case] access: Option<AccessType>,
        #[case] expected: bool,
    ) {
        assert_eq!(is_supported(&capability(mode, access)), expected);
    }

    #[test]
    fn empty_capabilities_are_rejected() {
        assert!(check_capabilities(&[]).is_err());
    }

    #[test]
    fn preferred_topology_wins_over_requisite() {
        let requirement = TopologyRequirement {
            requisite: vec![topology("nbg1")],
            preferred: vec![topology("hel1")],
        };
        assert_eq!(
            requested_location(Some(&requirement)),
            Some(String::from("hel1"))
        );
    }

    #[test]
    fn requisite_topology_is_used_without_preference() {
        let requirement = TopologyRequirement {
            requisite: vec![Topology::default(), topology("nbg1")],
            preferred: Vec::new(),
        };
        assert_eq!(
            requested_location(Some(&requirement)),
            Some(String::from("nbg1"))
        );
        assert_eq!(requested_location(None), None);
    }

    #[test]
    fn non_numeric_ids_are_not_found() {
        assert_eq!(parse_id("42", "volume"), Ok(42));
        assert!(matches!(
            parse_id("vol-abc", "volume"),
            Err(RequestError::NotFound(_))
        ));
    }
}
