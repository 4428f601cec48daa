use crate::Identifier;

/// The nine independent capacity dimensions carried by a device descriptor
/// (spec.md §3; field list grounded on the original's `VMAccelWorkloadDesc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkloadCapacity {
    pub mega_flops: u32,
    pub mega_ops: u32,
    pub llc_size_kb: u32,
    pub llc_bandwidth_mb_sec: u32,
    pub local_mem_size_kb: u32,
    pub local_mem_bandwidth_mb_sec: u32,
    pub non_local_mem_size_kb: u32,
    pub non_local_mem_bandwidth_mb_sec: u32,
    pub interconnect_bandwidth_mb_sec: u32,
}

impl WorkloadCapacity {
    /// Pointwise `<=`: a requester fits only if every dimension fits
    /// (spec.md §3).
    pub fn fits_within(&self, whole: &Self) -> bool {
        self.mega_flops <= whole.mega_flops
            && self.mega_ops <= whole.mega_ops
            && self.llc_size_kb <= whole.llc_size_kb
            && self.llc_bandwidth_mb_sec <= whole.llc_bandwidth_mb_sec
            && self.local_mem_size_kb <= whole.local_mem_size_kb
            && self.local_mem_bandwidth_mb_sec <= whole.local_mem_bandwidth_mb_sec
            && self.non_local_mem_size_kb <= whole.non_local_mem_size_kb
            && self.non_local_mem_bandwidth_mb_sec <= whole.non_local_mem_bandwidth_mb_sec
            && self.interconnect_bandwidth_mb_sec <= whole.interconnect_bandwidth_mb_sec
    }

    pub fn saturating_add(&self, other: &Self) -> Self {
        Self {
            mega_flops: self.mega_flops.saturating_add(other.mega_flops),
            mega_ops: self.mega_ops.saturating_add(other.mega_ops),
            llc_size_kb: self.llc_size_kb.saturating_add(other.llc_size_kb),
            llc_bandwidth_mb_sec: self
                .llc_bandwidth_mb_sec
                .saturating_add(other.llc_bandwidth_mb_sec),
            local_mem_size_kb: self
                .local_mem_size_kb
                .saturating_add(other.local_mem_size_kb),
            local_mem_bandwidth_mb_sec: self
                .local_mem_bandwidth_mb_sec
                .saturating_add(other.local_mem_bandwidth_mb_sec),
            non_local_mem_size_kb: self
                .non_local_mem_size_kb
                .saturating_add(other.non_local_mem_size_kb),
            non_local_mem_bandwidth_mb_sec: self
                .non_local_mem_bandwidth_mb_sec
                .saturating_add(other.non_local_mem_bandwidth_mb_sec),
            interconnect_bandwidth_mb_sec: self
                .interconnect_bandwidth_mb_sec
                .saturating_add(other.interconnect_bandwidth_mb_sec),
        }
    }

    pub fn saturating_sub(&self, other: &Self) -> Self {
        Self {
            mega_flops: self.mega_flops.saturating_sub(other.mega_flops),
            mega_ops: self.mega_ops.saturating_sub(other.mega_ops),
            llc_size_kb: self.llc_size_kb.saturating_sub(other.llc_size_kb),
            llc_bandwidth_mb_sec: self
                .llc_bandwidth_mb_sec
                .saturating_sub(other.llc_bandwidth_mb_sec),
            local_mem_size_kb: self
                .local_mem_size_kb
                .saturating_sub(other.local_mem_size_kb),
            local_mem_bandwidth_mb_sec: self
                .local_mem_bandwidth_mb_sec
                .saturating_sub(other.local_mem_bandwidth_mb_sec),
            non_local_mem_size_kb: self
                .non_local_mem_size_kb
                .saturating_sub(other.non_local_mem_size_kb),
            non_local_mem_bandwidth_mb_sec: self
                .non_local_mem_bandwidth_mb_sec
                .saturating_sub(other.non_local_mem_bandwidth_mb_sec),
            interconnect_bandwidth_mb_sec: self
                .interconnect_bandwidth_mb_sec
                .saturating_sub(other.interconnect_bandwidth_mb_sec),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.mega_flops == 0
            && self.mega_ops == 0
            && self.llc_size_kb == 0
            && self.llc_bandwidth_mb_sec == 0
            && self.local_mem_size_kb == 0
            && self.local_mem_bandwidth_mb_sec == 0
            && self.non_local_mem_size_kb == 0
            && self.non_local_mem_bandwidth_mb_sec == 0
            && self.interconnect_bandwidth_mb_sec == 0
    }
}

/// Accelerator type, independent of vendor architecture (on the wire
/// alongside `VMAccelDesc`, spec.md §3/§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AcceleratorType {
    Gpu,
    Cpu,
    Fpga,
    Asic,
}

/// A registered device's whole capacity plus the sidecar fields that are
/// deep-copied but never participate in ordering (spec.md §3).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VMAccelDesc {
    pub parent_id: Identifier,
    pub accel_type: AcceleratorType,
    pub capacity: WorkloadCapacity,
    /// Network/local address of the backing accelerator; deep-copied,
    /// non-ordering (spec.md §3).
    pub address: Vec<u8>,
    /// Bitmask of supported resource/format types; non-ordering sidecar.
    pub type_mask: u32,
    /// Supported surface formats; deep-copied, non-ordering sidecar.
    pub format_caps: Vec<u32>,
}

impl VMAccelDesc {
    pub fn fits_within(&self, whole: &Self) -> bool {
        self.capacity.fits_within(&whole.capacity)
    }

    pub fn saturating_add(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.capacity = self.capacity.saturating_add(&other.capacity);
        out
    }

    pub fn saturating_sub(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.capacity = self.capacity.saturating_sub(&other.capacity);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.capacity.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(mega_flops: u32) -> VMAccelDesc {
        VMAccelDesc {
            parent_id: 0,
            accel_type: AcceleratorType::Gpu,
            capacity: WorkloadCapacity {
                mega_flops,
                ..Default::default()
            },
            address: Vec::new(),
            type_mask: 0,
            format_caps: Vec::new(),
        }
    }

    #[test]
    fn pointwise_fit_requires_every_dimension() {
        let whole = desc(100);
        let small = desc(50);
        let big = desc(200);
        assert!(small.fits_within(&whole));
        assert!(!big.fits_within(&whole));
    }

    #[test]
    fn saturating_arithmetic_round_trips() {
        let whole = desc(100);
        let taken = desc(40);
        let remainder = whole.saturating_sub(&taken);
        assert_eq!(remainder.capacity.mega_flops, 60);
        assert_eq!(remainder.saturating_add(&taken).capacity.mega_flops, 100);
    }
}
