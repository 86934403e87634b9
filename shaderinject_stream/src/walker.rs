use std::marker::PhantomData;

use crate::{
    align_up, PipelineStateStreamDesc, StreamError, Subobject, SubobjectMut, SubobjectType,
};

const POINTER_ALIGN: usize = std::mem::align_of::<*const u8>();

/// Raw position inside a stream. Addresses are absolute so alignment follows the
/// real placement of the stream in memory.
#[derive(Debug, Clone)]
struct Cursor {
    start: usize,
    position: usize,
    end: usize,
    finished: bool,
}

struct Step {
    ty: SubobjectType,
    offset: usize,
    payload: usize,
    next: usize,
}

impl Cursor {
    fn new(start: *const u8, size: usize) -> Result<Self, StreamError> {
        let start = start as usize;
        if start == 0 && size != 0 {
            return Err(StreamError::NullStream { size });
        }
        if size != 0 && start % POINTER_ALIGN != 0 {
            return Err(StreamError::Misaligned { address: start });
        }
        Ok(Self {
            start,
            position: start,
            end: start + size,
            finished: false,
        })
    }

    /// For streams whose placement is already known to be valid.
    fn unchecked(start: *const u8, size: usize) -> Self {
        let start = start as usize;
        Self {
            start,
            position: start,
            end: start + size,
            finished: false,
        }
    }

    fn at_end(&self) -> bool {
        self.finished || self.position >= self.end
    }

    fn step(&self) -> Result<Step, StreamError> {
        let offset = self.position - self.start;
        if self.position + 4 > self.end {
            return Err(StreamError::Truncated { offset });
        }
        // SAFETY: the tag lies within [start, end)
        let tag = unsafe { (self.position as *const u32).read_unaligned() };
        let ty =
            SubobjectType::from_tag(tag).ok_or(StreamError::UnknownSubobject { tag, offset })?;
        let layout = ty.layout();

        let payload = align_up(self.position + 4, layout.align);
        if payload + layout.size > self.end {
            return Err(StreamError::Truncated { offset });
        }
        Ok(Step {
            ty,
            offset,
            payload,
            next: align_up(payload + layout.size, POINTER_ALIGN),
        })
    }

    fn next(&mut self) -> Option<Result<Step, StreamError>> {
        if self.at_end() {
            return None;
        }
        let step = self.step();
        match &step {
            Ok(step) => self.position = step.next,
            // the size of an unknown or truncated record is unknowable so nothing after it can be read
            Err(_) => self.finished = true,
        }
        Some(step)
    }
}

/// Forward-only reader over the records of a stream.
///
/// ```
/// use shaderinject_stream::{builder::StreamBuilder, StreamWalker, SubobjectType};
///
/// let stream = StreamBuilder::new().flags(0).sample_mask(!0).build();
/// let types = StreamWalker::from_bytes(stream.as_bytes())
///     .unwrap()
///     .map(|s| s.unwrap().ty)
///     .collect::<Vec<_>>();
/// assert_eq!(types, [SubobjectType::Flags, SubobjectType::SampleMask]);
/// ```
#[derive(Debug, Clone)]
pub struct StreamWalker<'a> {
    cursor: Cursor,
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> StreamWalker<'a> {
    /// # Safety
    /// `desc.subobject_stream` must be valid for reads of `desc.size_in_bytes` bytes for `'a`.
    pub unsafe fn new(desc: &PipelineStateStreamDesc) -> Result<Self, StreamError> {
        Ok(Self {
            cursor: Cursor::new(desc.subobject_stream as *const u8, desc.size_in_bytes)?,
            _marker: PhantomData,
        })
    }

    /// Walk a stream held in `bytes`, which must start on a pointer aligned address.
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, StreamError> {
        Ok(Self {
            cursor: Cursor::new(bytes.as_ptr(), bytes.len())?,
            _marker: PhantomData,
        })
    }

    pub(crate) fn from_parts(start: *const u8, size: usize) -> Self {
        Self {
            cursor: Cursor::unchecked(start, size),
            _marker: PhantomData,
        }
    }

    pub fn at_end(&self) -> bool {
        self.cursor.at_end()
    }

    /// Record at the cursor, `None` at the end of the stream.
    pub fn current(&self) -> Option<Result<Subobject<'a>, StreamError>> {
        if self.at_end() {
            return None;
        }
        Some(self.cursor.step().map(|step| Subobject {
            ty: step.ty,
            offset: step.offset,
            payload: step.payload as *const u8,
            _marker: PhantomData,
        }))
    }

    pub fn advance(&mut self) {
        self.cursor.next();
    }
}

impl<'a> Iterator for StreamWalker<'a> {
    type Item = Result<Subobject<'a>, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        let step = self.cursor.next()?;
        Some(step.map(|step| Subobject {
            ty: step.ty,
            offset: step.offset,
            payload: step.payload as *const u8,
            _marker: PhantomData,
        }))
    }
}

impl std::iter::FusedIterator for StreamWalker<'_> {}

/// Forward-only reader handing out editable records of a stream the caller owns.
#[derive(Debug)]
pub struct StreamWalkerMut<'a> {
    cursor: Cursor,
    _marker: PhantomData<&'a mut [u8]>,
}

impl<'a> StreamWalkerMut<'a> {
    /// # Safety
    /// `desc.subobject_stream` must be valid for reads and writes of
    /// `desc.size_in_bytes` bytes for `'a` and not otherwise aliased.
    pub unsafe fn new(desc: &PipelineStateStreamDesc) -> Result<Self, StreamError> {
        Ok(Self {
            cursor: Cursor::new(desc.subobject_stream as *const u8, desc.size_in_bytes)?,
            _marker: PhantomData,
        })
    }

    pub fn from_bytes(bytes: &'a mut [u8]) -> Result<Self, StreamError> {
        Ok(Self {
            cursor: Cursor::new(bytes.as_ptr(), bytes.len())?,
            _marker: PhantomData,
        })
    }

    pub(crate) fn from_parts(start: *mut u8, size: usize) -> Self {
        Self {
            cursor: Cursor::unchecked(start, size),
            _marker: PhantomData,
        }
    }
}

impl<'a> Iterator for StreamWalkerMut<'a> {
    type Item = Result<SubobjectMut<'a>, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        let step = self.cursor.next()?;
        Some(step.map(|step| SubobjectMut {
            ty: step.ty,
            offset: step.offset,
            payload: step.payload as *mut u8,
            _marker: PhantomData,
        }))
    }
}

impl std::iter::FusedIterator for StreamWalkerMut<'_> {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{builder::StreamBuilder, Payload};

    #[test]
    fn test_empty() {
        let mut walker = StreamWalker::from_bytes(&[]).unwrap();
        assert!(walker.at_end());
        assert!(walker.current().is_none());
        assert!(walker.next().is_none());

        let desc = PipelineStateStreamDesc::default();
        assert_eq!(0, unsafe { StreamWalker::new(&desc) }.unwrap().count());
    }

    #[test]
    fn test_null_stream() {
        let desc = PipelineStateStreamDesc {
            size_in_bytes: 16,
            subobject_stream: std::ptr::null_mut(),
        };
        assert_eq!(
            Some(StreamError::NullStream { size: 16 }),
            unsafe { StreamWalker::new(&desc) }.err()
        );
    }

    #[test]
    fn test_offsets_and_alignment() {
        // 4 byte payloads pack directly after the tag, 8 byte aligned ones are padded
        let code = [0xde, 0xad];
        let stream = StreamBuilder::new()
            .flags(3)
            .shader(SubobjectType::Vs, &code)
            .sample_mask(0xff)
            .node_mask(1)
            .build();
        let records = StreamWalker::from_bytes(stream.as_bytes())
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let offsets = records.iter().map(|r| (r.ty, r.offset)).collect::<Vec<_>>();
        assert_eq!(
            offsets,
            [
                (SubobjectType::Flags, 0),
                (SubobjectType::Vs, 8),
                (SubobjectType::SampleMask, 32),
                (SubobjectType::NodeMask, 40),
            ]
        );
        assert_eq!(48, stream.as_bytes().len());
        match records[1].payload() {
            Payload::Shader(bytecode) => {
                assert_eq!(&code, unsafe { bytecode.as_slice() });
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(records[0].payload(), Payload::Flags(3)));
    }

    #[test]
    fn test_current_and_advance() {
        let stream = StreamBuilder::new().flags(1).flags(2).build();
        let mut walker = StreamWalker::from_bytes(stream.as_bytes()).unwrap();
        let mut seen = vec![];
        while !walker.at_end() {
            let record = walker.current().unwrap().unwrap();
            if let Payload::Flags(flags) = record.payload() {
                seen.push(flags);
            }
            walker.advance();
        }
        assert_eq!(seen, [1, 2]);
    }

    #[test]
    fn test_unknown_tag_ends_walk() {
        let stream = StreamBuilder::new().flags(1).raw_tag(23).flags(2).build();
        let mut walker = StreamWalker::from_bytes(stream.as_bytes()).unwrap();
        assert!(walker.next().unwrap().is_ok());
        assert_eq!(
            StreamError::UnknownSubobject { tag: 23, offset: 8 },
            walker.next().unwrap().unwrap_err()
        );
        assert!(walker.at_end());
        assert!(walker.next().is_none());
    }

    #[test]
    fn test_truncated() {
        let stream = StreamBuilder::new()
            .flags(1)
            .shader(SubobjectType::Ps, &[1, 2, 3])
            .build();
        let bytes = &stream.as_bytes()[..20];
        let results = StreamWalker::from_bytes(bytes).unwrap().collect::<Vec<_>>();
        assert_eq!(2, results.len());
        assert!(results[0].is_ok());
        assert_eq!(
            &StreamError::Truncated { offset: 8 },
            results[1].as_ref().unwrap_err()
        );
    }

    #[test]
    fn test_misaligned() {
        let stream = StreamBuilder::new().flags(1).build();
        let bytes = &stream.as_bytes()[4..];
        assert!(matches!(
            StreamWalker::from_bytes(bytes),
            Err(StreamError::Misaligned { .. })
        ));
    }

    #[test]
    fn test_edit_in_place() {
        let mut stream = StreamBuilder::new().flags(1).sample_mask(2).build();
        for record in StreamWalkerMut::from_bytes(stream.as_bytes_mut()).unwrap() {
            let mut record = record.unwrap();
            if let crate::PayloadMut::Flags(flags) = record.payload_mut() {
                *flags = 9;
            }
        }
        let first = StreamWalker::from_bytes(stream.as_bytes())
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert!(matches!(first.payload(), Payload::Flags(9)));
    }
}
