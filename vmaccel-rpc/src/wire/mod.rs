//! Length-prefixed record encoding (spec.md §6): "any equivalent
//! [to XDR] length-prefixed struct encoding suffices." Fixed-size scalars
//! are big-endian 32-bit words; variable arrays are `(u32 length,
//! elements)`; strings are `(u32 length, bytes, zero-pad to 4-byte
//! boundary)`; unions are `(u32 discriminant, body)`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("unexpected end of buffer reading {0}")]
    UnexpectedEof(&'static str),
    #[error("invalid wire value: {0}")]
    Invalid(&'static str),
}

pub type WireResult<T> = Result<T, WireError>;

/// Append-only byte buffer for encoding (spec.md §6 encoding rules).
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u32(v as u32);
    }

    /// Variable array: `(u32 length, elements)`.
    pub fn write_array<T>(&mut self, items: &[T], mut write_elem: impl FnMut(&mut Self, &T)) {
        self.write_u32(items.len() as u32);
        for item in items {
            write_elem(self, item);
        }
    }

    pub fn write_bytes_array(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        self.pad_to_4();
    }

    /// String: `(u32 length, bytes, zero-pad to 4-byte boundary)`.
    pub fn write_string(&mut self, s: &str) {
        self.write_bytes_array(s.as_bytes());
    }

    fn pad_to_4(&mut self) {
        let pad = (4 - (self.buf.len() % 4)) % 4;
        self.buf.extend(std::iter::repeat(0u8).take(pad));
    }
}

/// Cursor over an encoded byte slice for decoding (spec.md §6).
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize, what: &'static str) -> WireResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(WireError::UnexpectedEof(what));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_u32(&mut self) -> WireResult<u32> {
        let bytes = self.take(4, "u32")?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("len 4")))
    }

    pub fn read_i32(&mut self) -> WireResult<i32> {
        let bytes = self.take(4, "i32")?;
        Ok(i32::from_be_bytes(bytes.try_into().expect("len 4")))
    }

    pub fn read_u64(&mut self) -> WireResult<u64> {
        let bytes = self.take(8, "u64")?;
        Ok(u64::from_be_bytes(bytes.try_into().expect("len 8")))
    }

    pub fn read_bool(&mut self) -> WireResult<bool> {
        Ok(self.read_u32()? != 0)
    }

    pub fn read_array<T>(&mut self, mut read_elem: impl FnMut(&mut Self) -> WireResult<T>) -> WireResult<Vec<T>> {
        let len = self.read_u32()? as usize;
        let mut out = Vec::with_capacity(len.min(1 << 20));
        for _ in 0..len {
            out.push(read_elem(self)?);
        }
        Ok(out)
    }

    pub fn read_bytes_array(&mut self) -> WireResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len, "byte array")?.to_vec();
        self.skip_pad(len);
        Ok(bytes)
    }

    pub fn read_string(&mut self) -> WireResult<String> {
        let bytes = self.read_bytes_array()?;
        String::from_utf8(bytes).map_err(|_| WireError::Invalid("string is not valid utf-8"))
    }

    fn skip_pad(&mut self, len: usize) {
        let pad = (4 - (len % 4)) % 4;
        self.pos = (self.pos + pad).min(self.buf.len());
    }
}

/// One length-prefixed record on the wire: a `u32` byte count followed by
/// that many bytes. Both requests and replies are framed this way so a
/// stream reader never has to speculatively parse past a record boundary.
pub fn write_frame(out: &mut Vec<u8>, payload: &[u8]) {
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
}

pub fn read_frame(reader: &mut Reader<'_>) -> WireResult<Vec<u8>> {
    let len = reader.read_u32()? as usize;
    reader.take(len, "frame body").map(|b| b.to_vec())
}

/// Read one length-prefixed frame directly off a socket/stream (spec.md
/// §6's framing applied to the RPC transport, as opposed to [`read_frame`]
/// which decodes from an in-memory buffer already obtained some other way).
/// An EOF before the length prefix is reported as `UnexpectedEof` so a
/// connection closing cleanly between requests can be told apart from one
/// closing mid-frame.
pub fn read_frame_from<R: std::io::Read>(r: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    Ok(body)
}

pub fn write_frame_to<W: std::io::Write>(w: &mut W, payload: &[u8]) -> std::io::Result<()> {
    w.write_all(&(payload.len() as u32).to_be_bytes())?;
    w.write_all(payload)
}

pub trait Encode {
    fn encode(&self, w: &mut Writer);
}

pub trait Decode: Sized {
    fn decode(r: &mut Reader<'_>) -> WireResult<Self>;
}

impl Encode for () {
    fn encode(&self, _w: &mut Writer) {}
}

impl Decode for () {
    fn decode(_r: &mut Reader<'_>) -> WireResult<Self> {
        Ok(())
    }
}

impl Encode for u32 {
    fn encode(&self, w: &mut Writer) {
        w.write_u32(*self);
    }
}

impl Decode for u32 {
    fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        r.read_u32()
    }
}

impl Encode for u64 {
    fn encode(&self, w: &mut Writer) {
        w.write_u64(*self);
    }
}

impl Decode for u64 {
    fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        r.read_u64()
    }
}

impl Encode for bool {
    fn encode(&self, w: &mut Writer) {
        w.write_bool(*self);
    }
}

impl Decode for bool {
    fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        r.read_bool()
    }
}

impl Encode for String {
    fn encode(&self, w: &mut Writer) {
        w.write_string(self);
    }
}

impl Decode for String {
    fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        r.read_string()
    }
}

impl Encode for Vec<u8> {
    fn encode(&self, w: &mut Writer) {
        w.write_bytes_array(self);
    }
}

impl Decode for Vec<u8> {
    fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        r.read_bytes_array()
    }
}

impl Encode for vmt::StatusCode {
    fn encode(&self, w: &mut Writer) {
        w.write_i32(*self as i32);
    }
}

impl Decode for vmt::StatusCode {
    fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        let raw = r.read_i32()?;
        vmt::StatusCode::from_i32(raw).ok_or(WireError::Invalid("unknown status_code"))
    }
}

impl Encode for vmt::WorkloadCapacity {
    fn encode(&self, w: &mut Writer) {
        w.write_u32(self.mega_flops);
        w.write_u32(self.mega_ops);
        w.write_u32(self.llc_size_kb);
        w.write_u32(self.llc_bandwidth_mb_sec);
        w.write_u32(self.local_mem_size_kb);
        w.write_u32(self.local_mem_bandwidth_mb_sec);
        w.write_u32(self.non_local_mem_size_kb);
        w.write_u32(self.non_local_mem_bandwidth_mb_sec);
        w.write_u32(self.interconnect_bandwidth_mb_sec);
    }
}

impl Decode for vmt::WorkloadCapacity {
    fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        Ok(Self {
            mega_flops: r.read_u32()?,
            mega_ops: r.read_u32()?,
            llc_size_kb: r.read_u32()?,
            llc_bandwidth_mb_sec: r.read_u32()?,
            local_mem_size_kb: r.read_u32()?,
            local_mem_bandwidth_mb_sec: r.read_u32()?,
            non_local_mem_size_kb: r.read_u32()?,
            non_local_mem_bandwidth_mb_sec: r.read_u32()?,
            interconnect_bandwidth_mb_sec: r.read_u32()?,
        })
    }
}

fn accel_type_to_u32(t: vmt::AcceleratorType) -> u32 {
    match t {
        vmt::AcceleratorType::Gpu => 0,
        vmt::AcceleratorType::Cpu => 1,
        vmt::AcceleratorType::Fpga => 2,
        vmt::AcceleratorType::Asic => 3,
    }
}

fn accel_type_from_u32(v: u32) -> WireResult<vmt::AcceleratorType> {
    match v {
        0 => Ok(vmt::AcceleratorType::Gpu),
        1 => Ok(vmt::AcceleratorType::Cpu),
        2 => Ok(vmt::AcceleratorType::Fpga),
        3 => Ok(vmt::AcceleratorType::Asic),
        _ => Err(WireError::Invalid("unknown accelerator_type")),
    }
}

impl Encode for vmt::VMAccelDesc {
    fn encode(&self, w: &mut Writer) {
        self.parent_id.encode(w);
        w.write_u32(accel_type_to_u32(self.accel_type));
        self.capacity.encode(w);
        w.write_bytes_array(&self.address);
        w.write_u32(self.type_mask);
        w.write_array(&self.format_caps, |w, v| w.write_u32(*v));
    }
}

impl Decode for vmt::VMAccelDesc {
    fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        Ok(Self {
            parent_id: vmt::Identifier::decode(r)?,
            accel_type: accel_type_from_u32(r.read_u32()?)?,
            capacity: vmt::WorkloadCapacity::decode(r)?,
            address: r.read_bytes_array()?,
            type_mask: r.read_u32()?,
            format_caps: r.read_array(|r| r.read_u32())?,
        })
    }
}

impl Encode for vmt::AllocRange {
    fn encode(&self, w: &mut Writer) {
        w.write_u64(self.size);
        w.write_u64(self.begin);
        w.write_u64(self.end);
    }
}

impl Decode for vmt::AllocRange {
    fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        Ok(Self {
            size: r.read_u64()?,
            begin: r.read_u64()?,
            end: r.read_u64()?,
        })
    }
}

fn surface_type_to_u32(t: vmt::SurfaceType) -> u32 {
    match t {
        vmt::SurfaceType::Buffer => 0,
        vmt::SurfaceType::Image1D => 1,
        vmt::SurfaceType::Image2D => 2,
        vmt::SurfaceType::Image3D => 3,
    }
}

fn surface_type_from_u32(v: u32) -> WireResult<vmt::SurfaceType> {
    match v {
        0 => Ok(vmt::SurfaceType::Buffer),
        1 => Ok(vmt::SurfaceType::Image1D),
        2 => Ok(vmt::SurfaceType::Image2D),
        3 => Ok(vmt::SurfaceType::Image3D),
        _ => Err(WireError::Invalid("unknown surf_type")),
    }
}

fn surface_pool_to_u32(p: vmt::SurfacePool) -> u32 {
    match p {
        vmt::SurfacePool::Auto => 0,
        vmt::SurfacePool::Accelerator => 1,
        vmt::SurfacePool::System => 2,
    }
}

fn surface_pool_from_u32(v: u32) -> WireResult<vmt::SurfacePool> {
    match v {
        0 => Ok(vmt::SurfacePool::Auto),
        1 => Ok(vmt::SurfacePool::Accelerator),
        2 => Ok(vmt::SurfacePool::System),
        _ => Err(WireError::Invalid("unknown pool")),
    }
}

fn surface_usage_to_u32(u: vmt::SurfaceUsage) -> u32 {
    match u {
        vmt::SurfaceUsage::ReadOnly => 0,
        vmt::SurfaceUsage::WriteOnly => 1,
        vmt::SurfaceUsage::ReadWrite => 2,
    }
}

fn surface_usage_from_u32(v: u32) -> WireResult<vmt::SurfaceUsage> {
    match v {
        0 => Ok(vmt::SurfaceUsage::ReadOnly),
        1 => Ok(vmt::SurfaceUsage::WriteOnly),
        2 => Ok(vmt::SurfaceUsage::ReadWrite),
        _ => Err(WireError::Invalid("unknown usage")),
    }
}

impl Encode for vmt::SurfaceDesc {
    fn encode(&self, w: &mut Writer) {
        self.parent_id.encode(w);
        w.write_u32(surface_type_to_u32(self.surf_type));
        w.write_u32(self.width);
        w.write_u32(self.height);
        w.write_u32(self.depth);
        w.write_u32(self.mip_levels);
        w.write_u32(self.array_size);
        w.write_u32(self.samples);
        w.write_u32(self.format);
        w.write_u32(self.format_caps.bits());
        w.write_u32(surface_pool_to_u32(self.pool));
        w.write_u32(surface_usage_to_u32(self.usage));
        w.write_u32(self.bind_flags.bits());
        w.write_u32(self.slice_pitch);
        w.write_u32(self.row_pitch);
    }
}

impl Decode for vmt::SurfaceDesc {
    fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        Ok(Self {
            parent_id: vmt::Identifier::decode(r)?,
            surf_type: surface_type_from_u32(r.read_u32()?)?,
            width: r.read_u32()?,
            height: r.read_u32()?,
            depth: r.read_u32()?,
            mip_levels: r.read_u32()?,
            array_size: r.read_u32()?,
            samples: r.read_u32()?,
            format: r.read_u32()?,
            format_caps: vmt::FormatCaps::from_bits_truncate(r.read_u32()?),
            pool: surface_pool_from_u32(r.read_u32()?)?,
            usage: surface_usage_from_u32(r.read_u32()?)?,
            bind_flags: vmt::BindFlags::from_bits_truncate(r.read_u32()?),
            slice_pitch: r.read_u32()?,
            row_pitch: r.read_u32()?,
        })
    }
}

impl Encode for vmt::WorkTopology {
    fn encode(&self, w: &mut Writer) {
        w.write_array(&self.global_offset, |w, v| w.write_u32(*v));
        w.write_array(&self.global_size, |w, v| w.write_u32(*v));
        w.write_array(&self.local_size, |w, v| w.write_u32(*v));
    }
}

impl Decode for vmt::WorkTopology {
    fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        Ok(Self {
            global_offset: r.read_array(|r| r.read_u32())?,
            global_size: r.read_array(|r| r.read_u32())?,
            local_size: r.read_array(|r| r.read_u32())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trips_with_padding() {
        let mut w = Writer::new();
        w.write_string("abc");
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 4 + 4);
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_string().unwrap(), "abc");
    }

    #[test]
    fn desc_round_trips() {
        let desc = vmt::VMAccelDesc {
            parent_id: 7,
            accel_type: vmt::AcceleratorType::Fpga,
            capacity: vmt::WorkloadCapacity { mega_flops: 9, ..Default::default() },
            address: vec![1, 2, 3],
            type_mask: 0xAB,
            format_caps: vec![1, 2, 3, 4],
        };
        let mut w = Writer::new();
        desc.encode(&mut w);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        let decoded = vmt::VMAccelDesc::decode(&mut r).unwrap();
        assert_eq!(decoded, desc);
    }

    #[test]
    fn frame_round_trips_and_detects_truncation() {
        let mut out = Vec::new();
        write_frame(&mut out, b"hello");
        let mut r = Reader::new(&out);
        assert_eq!(read_frame(&mut r).unwrap(), b"hello");

        let truncated = &out[..out.len() - 1];
        let mut r2 = Reader::new(truncated);
        assert!(read_frame(&mut r2).is_err());
    }
}
