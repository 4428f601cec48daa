use bitflags::bitflags;

use crate::Identifier;

/// Dimensionality/shape of a surface (spec.md §3: "buffer/1D/2D/3D image").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SurfaceType {
    Buffer,
    Image1D,
    Image2D,
    Image3D,
}

/// Where the backend should place the surface's device-side storage
/// (spec.md §3, §4.3: selects the upload path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SurfacePool {
    Auto,
    Accelerator,
    System,
}

/// Access pattern the surface was created with (spec.md §3/§4.3: gates the
/// download-skip optimization for read-only surfaces).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SurfaceUsage {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

bitflags! {
    /// Bind targets a surface may be used as (spec.md §3/§6, "bind-flags
    /// bitmask").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct BindFlags: u32 {
        const KERNEL_ARG      = 0b0000_0001;
        const RENDER_TARGET   = 0b0000_0010;
        const SAMPLED         = 0b0000_0100;
        const STREAM_OUTPUT   = 0b0000_1000;
        const TRANSFER_SRC    = 0b0001_0000;
        const TRANSFER_DST    = 0b0010_0000;
    }
}

bitflags! {
    /// Per-format capability bitmask (spec.md §3, "format caps bitmask").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct FormatCaps: u32 {
        const SAMPLE    = 0b0000_0001;
        const RENDER    = 0b0000_0010;
        const BLEND     = 0b0000_0100;
        const MIPMAP    = 0b0000_1000;
    }
}

/// Wire-level surface descriptor (spec.md §6, "Surface descriptor fields on
/// the wire").
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SurfaceDesc {
    pub parent_id: Identifier,
    pub surf_type: SurfaceType,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_size: u32,
    pub samples: u32,
    pub format: u32,
    pub format_caps: FormatCaps,
    pub pool: SurfacePool,
    pub usage: SurfaceUsage,
    pub bind_flags: BindFlags,
    pub slice_pitch: u32,
    pub row_pitch: u32,
}

impl SurfaceDesc {
    /// Total backing-store size in bytes for a linear (non-tiled) layout.
    /// `row_pitch`/`slice_pitch` of zero mean "derive from width/height", the
    /// convention the original leaves implicit for buffer-typed surfaces.
    pub fn backing_len(&self) -> usize {
        match self.surf_type {
            SurfaceType::Buffer => self.width as usize,
            SurfaceType::Image1D => self.row_pitch.max(self.width) as usize,
            SurfaceType::Image2D => {
                let row = self.row_pitch.max(self.width) as usize;
                row * self.height.max(1) as usize
            }
            SurfaceType::Image3D => {
                let row = self.row_pitch.max(self.width) as usize;
                let slice = self.slice_pitch.max((row as u32) * self.height.max(1)) as usize;
                slice * self.depth.max(1) as usize
            }
        }
    }
}

/// `(global-offset[], global-size[], local-size[])` tuple describing a
/// dispatch's iteration space (spec.md §3, GLOSSARY "Work topology").
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkTopology {
    pub global_offset: Vec<u32>,
    pub global_size: Vec<u32>,
    pub local_size: Vec<u32>,
}

impl WorkTopology {
    pub fn dims(&self) -> usize {
        self.global_size.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image2d_backing_len_uses_row_pitch() {
        let d = SurfaceDesc {
            parent_id: 0,
            surf_type: SurfaceType::Image2D,
            width: 16,
            height: 4,
            depth: 1,
            mip_levels: 1,
            array_size: 1,
            samples: 1,
            format: 0,
            format_caps: FormatCaps::empty(),
            pool: SurfacePool::Auto,
            usage: SurfaceUsage::ReadWrite,
            bind_flags: BindFlags::KERNEL_ARG,
            slice_pitch: 0,
            row_pitch: 64,
        };
        assert_eq!(d.backing_len(), 64 * 4);
    }
}
