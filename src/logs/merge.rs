//! K-way merge of record streams into one time-ordered stream.

#![allow(missing_docs)]

use crate::core::errors::Result;
use crate::logs::descriptor::FileDescriptor;
use crate::logs::item::{LogItem, Timestamp};
use crate::logs::iterator::{FileIterator, LogStream};

/// Emits the record with the smallest time among all live streams; ties go
/// to the stream with the smallest index. Exhausted streams are closed and
/// removed in place.
#[derive(Debug)]
pub struct MergeSequence<S: LogStream = FileIterator> {
    streams: Vec<S>,
}

impl<S: LogStream> MergeSequence<S> {
    pub fn new(streams: Vec<S>) -> Self {
        Self { streams }
    }

    pub fn push(&mut self, stream: S) {
        self.streams.push(stream);
    }

    /// Number of streams not yet known to be exhausted.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    fn smallest_peek(&self) -> Option<(usize, Timestamp)> {
        let mut best: Option<(usize, Timestamp)> = None;
        for (idx, stream) in self.streams.iter().enumerate() {
            if let Some(item) = stream.peek()
                && best.is_none_or(|(_, t)| item.time < t)
            {
                best = Some((idx, item.time));
            }
        }
        best
    }
}

impl MergeSequence<FileIterator> {
    /// Open one iterator per descriptor. Files that cannot be opened are
    /// skipped with a warning.
    pub fn open(descriptors: &[FileDescriptor], begin: Timestamp, end: Timestamp) -> Self {
        let mut streams = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            match FileIterator::open(descriptor, begin, end) {
                Ok(iter) => streams.push(iter),
                Err(e) => eprintln!(
                    "[DIAG-SEARCH] skipping {}: {e}",
                    descriptor.path().display()
                ),
            }
        }
        Self::new(streams)
    }
}

impl<S: LogStream> LogStream for MergeSequence<S> {
    fn peek(&self) -> Option<&LogItem> {
        let (idx, _) = self.smallest_peek()?;
        self.streams[idx].peek()
    }

    fn next_item(&mut self) -> Result<Option<LogItem>> {
        // Drain streams with nothing to show: they are either exhausted or
        // holding a latched error.
        let mut idx = 0;
        while idx < self.streams.len() {
            if self.streams[idx].peek().is_some() {
                idx += 1;
                continue;
            }
            match self.streams[idx].next_item()? {
                Some(item) => return Ok(Some(item)),
                None => {
                    let mut done = self.streams.remove(idx);
                    done.close();
                }
            }
        }

        match self.smallest_peek() {
            Some((idx, _)) => self.streams[idx].next_item(),
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        for stream in &mut self.streams {
            stream.close();
        }
        self.streams.clear();
    }
}

impl<S: LogStream> Iterator for MergeSequence<S> {
    type Item = Result<LogItem>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_item().transpose()
    }
}
