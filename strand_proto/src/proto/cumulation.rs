//! Inbound Byte Accumulation
//!
//! A [`Cumulation`] holds the bytes a connection has received but not yet
//! decoded. It tracks a reader index: everything before it has been consumed
//! by the codec, everything after it is unread. The index only moves forward
//! through [`Cumulation::advance`], and only by the amount a decode attempt
//! actually consumed.
//!
//! # Features
//!
//! - Two representations: one contiguous `BytesMut`, or a chain of frozen
//!   segments appended without copying
//! - [`Cumulator`] strategies that choose the representation
//! - A read view implementing [`bytes::Buf`] over the unread bytes
//! - Compaction that drops the consumed prefix and coalesces segments
//!
//! # Important Notes
//!
//! - Advancing a [`ReadView`] never moves the reader index; the framing
//!   decoder commits consumption explicitly
//! - The composite representation is only cheaper when chunks are large and
//!   frames span many of them

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use strand_types::config::CumulatorKind;

pub enum Cumulation {
    Contiguous {
        buf: BytesMut,
        reader_index: usize,
    },
    /// Consumed segments are kept until compaction, so `reader_index` is an
    /// offset into the whole chain
    Segmented {
        segments: VecDeque<Bytes>,
        reader_index: usize,
        len: usize,
    },
}

impl Cumulation {
    pub fn contiguous(buf: BytesMut) -> Self {
        Self::Contiguous {
            buf,
            reader_index: 0,
        }
    }

    pub fn segmented(first: Bytes) -> Self {
        let len = first.len();
        let mut segments = VecDeque::new();
        segments.push_back(first);
        Self::Segmented {
            segments,
            reader_index: 0,
            len,
        }
    }

    /// Unread bytes
    pub fn len(&self) -> usize {
        match self {
            Self::Contiguous { buf, reader_index } => buf.len() - *reader_index,
            Self::Segmented {
                len, reader_index, ..
            } => *len - *reader_index,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes consumed since the last compaction
    pub fn reader_index(&self) -> usize {
        match self {
            Self::Contiguous { reader_index, .. } | Self::Segmented { reader_index, .. } => {
                *reader_index
            }
        }
    }

    /// A view over the unread bytes. Consuming the view leaves `self` as is
    pub fn view(&self) -> ReadView<'_> {
        match self {
            Self::Contiguous { buf, reader_index } => ReadView::Contiguous(&buf[*reader_index..]),
            Self::Segmented {
                segments,
                reader_index,
                ..
            } => ReadView::Segmented(SegmentedView::new(segments, *reader_index, self.len())),
        }
    }

    /// Marks `cnt` unread bytes as consumed
    pub fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.len(),
            "cannot consume {cnt} bytes with {} unread",
            self.len()
        );

        match self {
            Self::Contiguous { reader_index, .. } | Self::Segmented { reader_index, .. } => {
                *reader_index += cnt
            }
        }
    }

    /// Discards the consumed prefix and coalesces segments into one
    pub fn compact(&mut self) {
        match self {
            Self::Contiguous { buf, reader_index } => {
                buf.advance(*reader_index);
                *reader_index = 0;
            }
            Self::Segmented { .. } => {
                let remaining = self.view().copy_to_bytes(self.len());
                *self = Self::segmented(remaining);
            }
        }
    }

    fn into_unread(self) -> BytesMut {
        match self {
            Self::Contiguous {
                mut buf,
                reader_index,
            } => {
                buf.advance(reader_index);
                buf
            }
            Self::Segmented { .. } => {
                let len = self.len();
                let mut buf = BytesMut::with_capacity(len);
                let mut view = self.view();
                while view.has_remaining() {
                    let chunk = view.chunk();
                    let n = chunk.len();
                    buf.extend_from_slice(chunk);
                    view.advance(n);
                }
                buf
            }
        }
    }
}

/// Combines a newly received chunk with whatever is already buffered
pub trait Cumulator: Send + Sync + 'static {
    fn cumulate(&self, cumulation: Option<Cumulation>, chunk: BytesMut) -> Cumulation;
}

/// Copies every chunk into one contiguous buffer
#[derive(Copy, Clone, Debug, Default)]
pub struct MergeCumulator;

impl Cumulator for MergeCumulator {
    fn cumulate(&self, cumulation: Option<Cumulation>, chunk: BytesMut) -> Cumulation {
        match cumulation {
            None => Cumulation::contiguous(chunk),
            Some(Cumulation::Contiguous {
                mut buf,
                reader_index,
            }) => {
                if buf.len() == reader_index {
                    // nothing unread, so the chunk can be adopted as is
                    return Cumulation::contiguous(chunk);
                }
                buf.extend_from_slice(&chunk);
                Cumulation::Contiguous { buf, reader_index }
            }
            Some(segmented) => {
                let mut buf = segmented.into_unread();
                buf.extend_from_slice(&chunk);
                Cumulation::contiguous(buf)
            }
        }
    }
}

/// Chains every chunk as another segment without copying it
#[derive(Copy, Clone, Debug, Default)]
pub struct CompositeCumulator;

impl Cumulator for CompositeCumulator {
    fn cumulate(&self, cumulation: Option<Cumulation>, chunk: BytesMut) -> Cumulation {
        let chunk = chunk.freeze();
        match cumulation {
            None => Cumulation::segmented(chunk),
            Some(Cumulation::Segmented {
                mut segments,
                reader_index,
                len,
            }) => {
                let added = chunk.len();
                if added > 0 {
                    segments.push_back(chunk);
                }
                Cumulation::Segmented {
                    segments,
                    reader_index,
                    len: len + added,
                }
            }
            Some(contiguous) => {
                let mut next = Cumulation::segmented(contiguous.into_unread().freeze());
                if let Cumulation::Segmented { segments, len, .. } = &mut next {
                    *len += chunk.len();
                    segments.push_back(chunk);
                }
                next
            }
        }
    }
}

pub fn cumulator_for(kind: CumulatorKind) -> std::sync::Arc<dyn Cumulator> {
    match kind {
        CumulatorKind::Merge => std::sync::Arc::new(MergeCumulator),
        CumulatorKind::Composite => std::sync::Arc::new(CompositeCumulator),
    }
}

/// Read-only cursor over the unread bytes of a [`Cumulation`]
pub enum ReadView<'a> {
    Contiguous(&'a [u8]),
    Segmented(SegmentedView<'a>),
}

impl Buf for ReadView<'_> {
    fn remaining(&self) -> usize {
        match self {
            Self::Contiguous(slice) => slice.remaining(),
            Self::Segmented(view) => view.remaining(),
        }
    }

    fn chunk(&self) -> &[u8] {
        match self {
            Self::Contiguous(slice) => slice,
            Self::Segmented(view) => view.chunk(),
        }
    }

    fn advance(&mut self, cnt: usize) {
        match self {
            Self::Contiguous(slice) => slice.advance(cnt),
            Self::Segmented(view) => view.advance(cnt),
        }
    }
}

pub struct SegmentedView<'a> {
    segments: &'a VecDeque<Bytes>,
    index: usize,
    offset: usize,
    remaining: usize,
}

impl<'a> SegmentedView<'a> {
    fn new(segments: &'a VecDeque<Bytes>, offset: usize, remaining: usize) -> Self {
        let mut view = Self {
            segments,
            index: 0,
            offset,
            remaining,
        };
        view.skip_exhausted();
        view
    }

    fn skip_exhausted(&mut self) {
        while self.index < self.segments.len() && self.offset >= self.segments[self.index].len() {
            self.offset -= self.segments[self.index].len();
            self.index += 1;
        }
    }
}

impl Buf for SegmentedView<'_> {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn chunk(&self) -> &[u8] {
        match self.segments.get(self.index) {
            Some(segment) => &segment[self.offset..],
            None => &[],
        }
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.remaining,
            "cannot advance past the end of the view"
        );
        self.remaining -= cnt;
        self.offset += cnt;
        self.skip_exhausted();
    }
}

#[cfg(test)]
mod tests {
    use crate::proto::cumulation::{CompositeCumulator, Cumulation, Cumulator, MergeCumulator};
    use bytes::{Buf, BytesMut};
    use rstest::rstest;
    use std::sync::Arc;

    fn chunk(data: &[u8]) -> BytesMut {
        BytesMut::from(data)
    }

    fn unread(cumulation: &Cumulation) -> Vec<u8> {
        let mut view = cumulation.view();
        view.copy_to_bytes(view.remaining()).to_vec()
    }

    #[rstest]
    #[case(Arc::new(MergeCumulator))]
    #[case(Arc::new(CompositeCumulator))]
    fn cumulates_in_order(#[case] cumulator: Arc<dyn Cumulator>) {
        let mut cumulation = Some(cumulator.cumulate(None, chunk(b"hel")));
        for part in [&b"lo "[..], b"", b"wor", b"ld"] {
            cumulation = Some(cumulator.cumulate(cumulation.take(), chunk(part)));
        }
        let cumulation = cumulation.unwrap();
        assert_eq!(cumulation.len(), 11);
        assert_eq!(unread(&cumulation), b"hello world");
    }

    #[rstest]
    #[case(Arc::new(MergeCumulator))]
    #[case(Arc::new(CompositeCumulator))]
    fn view_does_not_move_reader_index(#[case] cumulator: Arc<dyn Cumulator>) {
        let first = cumulator.cumulate(None, chunk(b"abc"));
        let mut cumulation = cumulator.cumulate(Some(first), chunk(b"defg"));
        {
            let mut view = cumulation.view();
            view.advance(5);
            assert_eq!(view.remaining(), 2);
        }
        assert_eq!(cumulation.reader_index(), 0);
        assert_eq!(cumulation.len(), 7);

        cumulation.advance(4);
        assert_eq!(unread(&cumulation), b"efg");
        cumulation.advance(1);
        assert_eq!(unread(&cumulation), b"fg");

        cumulation.compact();
        assert_eq!(cumulation.reader_index(), 0);
        assert_eq!(unread(&cumulation), b"fg");
    }

    #[test]
    fn segmented_view_crosses_segment_boundaries() {
        let cumulator = CompositeCumulator;
        let mut cumulation = cumulator.cumulate(None, chunk(&[0, 0]));
        cumulation = cumulator.cumulate(Some(cumulation), chunk(&[0, 5]));
        cumulation = cumulator.cumulate(Some(cumulation), chunk(&[9]));
        let mut view = cumulation.view();
        assert_eq!(view.get_u32(), 5);
        assert_eq!(view.get_u8(), 9);
        assert!(!view.has_remaining());
    }

    #[test]
    fn merge_adopts_chunk_when_drained() {
        let cumulator = MergeCumulator;
        let mut cumulation = cumulator.cumulate(None, chunk(b"ab"));
        cumulation.advance(2);
        let cumulation = cumulator.cumulate(Some(cumulation), chunk(b"cd"));
        assert_eq!(cumulation.reader_index(), 0);
        assert_eq!(unread(&cumulation), b"cd");
    }
}
