/// Element type of a registered region.
///
/// Only the element size matters to the fabric; data is moved as raw bytes
/// and never converted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Datatype {
    Byte,
    Int32,
    Int64,
    Float32,
    Float64,
    /// Opaque fixed-size element of the given byte width.
    Bytes(u32),
}

impl Datatype {
    pub fn size_bytes(self) -> usize {
        match self {
            Datatype::Byte => 1,
            Datatype::Int32 | Datatype::Float32 => 4,
            Datatype::Int64 | Datatype::Float64 => 8,
            Datatype::Bytes(width) => width as usize,
        }
    }

    /// Byte extent of `count` elements, `None` on overflow.
    pub fn extent(self, count: usize) -> Option<usize> {
        self.size_bytes().checked_mul(count)
    }

    /// Stable wire code paired with the element width.
    pub fn code(self) -> (u32, u32) {
        let code = match self {
            Datatype::Byte => 0,
            Datatype::Int32 => 1,
            Datatype::Int64 => 2,
            Datatype::Float32 => 3,
            Datatype::Float64 => 4,
            Datatype::Bytes(_) => 5,
        };
        (code, self.size_bytes() as u32)
    }

    pub fn from_code(code: u32, width: u32) -> Option<Self> {
        let datatype = match code {
            0 => Datatype::Byte,
            1 => Datatype::Int32,
            2 => Datatype::Int64,
            3 => Datatype::Float32,
            4 => Datatype::Float64,
            5 => Datatype::Bytes(width),
            _ => return None,
        };
        (datatype.size_bytes() as u32 == width).then_some(datatype)
    }
}
