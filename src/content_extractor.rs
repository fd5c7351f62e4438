//! Content Extractor
//! Streams attribute bytes from resident payloads or resolved cluster runs.

use std::ops::Range;

use crate::errors::EntryError;
use crate::ntfs_parser::{Attribute, AttributePayload, DataRun, Volume};
use crate::volume_reader::VolumeReader;

/// Lazy, finite byte-chunk stream over one attribute's content. Not
/// restartable; callers needing a second pass open a new stream.
///
/// Yields borrowed chunks in ascending logical order, trimmed to the
/// requested range and to the declared data size (cluster-rounding slack is
/// never emitted). A run that cannot be read in full delivers whatever was
/// readable and then surfaces `ShortRead` with the obtained/expected counts.
pub struct ContentStream<'a> {
    reader: &'a VolumeReader,
    volume: &'a Volume,
    state: State<'a>,
}

enum State<'a> {
    Resident { data: &'a [u8] },
    Runs {
        // (logical byte offset of run start, run)
        runs: Vec<(u64, &'a DataRun)>,
        pos: u64,
        end: u64,
        expected: u64,
        obtained: u64,
    },
    Failed(EntryError),
    Done,
}

impl<'a> ContentStream<'a> {
    /// Open a stream over an attribute, optionally restricted to a logical
    /// byte range. Fails up front for encodings the engine will not decode.
    pub fn open(
        attribute: &'a Attribute,
        reader: &'a VolumeReader,
        volume: &'a Volume,
        range: Option<Range<u64>>,
    ) -> Result<ContentStream<'a>, EntryError> {
        if let Some(kind) = attribute.unsupported_encoding() {
            return Err(EntryError::UnsupportedAttribute(kind));
        }

        match &attribute.payload {
            AttributePayload::Resident(data) => {
                let len = data.len() as u64;
                let range = clamp_range(range, len);
                Ok(ContentStream {
                    reader,
                    volume,
                    state: State::Resident {
                        data: &data[range.start as usize..range.end as usize],
                    },
                })
            }
            AttributePayload::NonResident { data_size, runs } => {
                Ok(Self::over_runs(reader, volume, runs, *data_size, range))
            }
            AttributePayload::Malformed => Err(EntryError::MalformedDataRuns),
        }
    }

    /// Stream directly over a run list with a declared size. Also used by the
    /// MFT record store and the index walker, which hold bare run lists.
    pub fn over_runs(
        reader: &'a VolumeReader,
        volume: &'a Volume,
        runs: &'a [DataRun],
        data_size: u64,
        range: Option<Range<u64>>,
    ) -> ContentStream<'a> {
        let range = clamp_range(range, data_size);
        let cluster_size = volume.cluster_size as u64;
        let mut offsets = Vec::with_capacity(runs.len());
        let mut logical = 0u64;
        for run in runs {
            offsets.push((logical, run));
            // Saturate on crafted run lists; the per-run volume bounds check
            // rejects them before any read.
            logical = logical.saturating_add(run.cluster_count.saturating_mul(cluster_size));
        }
        ContentStream {
            reader,
            volume,
            state: State::Runs {
                runs: offsets,
                pos: range.start,
                end: range.end,
                expected: range.end - range.start,
                obtained: 0,
            },
        }
    }
}

fn clamp_range(range: Option<Range<u64>>, len: u64) -> Range<u64> {
    match range {
        Some(r) => {
            let start = r.start.min(len);
            start..r.end.min(len).max(start)
        }
        None => 0..len,
    }
}

impl<'a> Iterator for ContentStream<'a> {
    type Item = Result<&'a [u8], EntryError>;

    fn next(&mut self) -> Option<Self::Item> {
        match std::mem::replace(&mut self.state, State::Done) {
            State::Resident { data } => {
                if data.is_empty() {
                    None
                } else {
                    Some(Ok(data))
                }
            }
            State::Done => None,
            State::Failed(e) => Some(Err(e)),
            State::Runs {
                runs,
                pos,
                end,
                expected,
                obtained,
            } => {
                if pos >= end {
                    return None;
                }

                let cluster_size = self.volume.cluster_size as u64;
                let found = runs
                    .iter()
                    .find(|(start, run)| {
                        let span = run.cluster_count.saturating_mul(cluster_size);
                        pos >= *start && pos < start.saturating_add(span)
                    })
                    .copied();

                let Some((run_start, run)) = found else {
                    // Run list stops short of the declared size.
                    return Some(Err(EntryError::ShortRead { obtained, expected }));
                };

                if run.is_sparse {
                    return Some(Err(EntryError::UnsupportedAttribute("sparse")));
                }
                let run_past_volume = (run.start_cluster as u64)
                    .checked_add(run.cluster_count)
                    .map_or(true, |e| e > self.volume.total_clusters);
                if run.start_cluster < 0 || run_past_volume {
                    return Some(Err(EntryError::RunOutOfRange {
                        start: run.start_cluster,
                        count: run.cluster_count,
                        total: self.volume.total_clusters,
                    }));
                }

                let within = pos - run_start;
                let run_end =
                    run_start.saturating_add(run.cluster_count.saturating_mul(cluster_size));
                let want = (end.min(run_end) - pos) as usize;
                let byte_offset =
                    (run.start_cluster as u64).saturating_mul(cluster_size) + within;

                match self.reader.read_at(byte_offset, want) {
                    Ok(chunk) => {
                        self.state = State::Runs {
                            runs,
                            pos: pos + want as u64,
                            end,
                            expected,
                            obtained: obtained + want as u64,
                        };
                        Some(Ok(chunk))
                    }
                    Err(EntryError::TruncatedImage { available, .. }) if available > 0 => {
                        // Deliver the readable prefix, then report the short read.
                        let partial = available as usize;
                        match self.reader.read_at(byte_offset, partial) {
                            Ok(chunk) => {
                                self.state = State::Failed(EntryError::ShortRead {
                                    obtained: obtained + partial as u64,
                                    expected,
                                });
                                Some(Ok(chunk))
                            }
                            Err(_) => Some(Err(EntryError::ShortRead { obtained, expected })),
                        }
                    }
                    Err(_) => Some(Err(EntryError::ShortRead { obtained, expected })),
                }
            }
        }
    }
}

/// Read an exact logical byte range out of a run list. `ShortRead` if the
/// full range cannot be produced.
pub fn read_run_range(
    reader: &VolumeReader,
    volume: &Volume,
    runs: &[DataRun],
    offset: u64,
    len: usize,
) -> Result<Vec<u8>, EntryError> {
    let mut out = Vec::with_capacity(len);
    let stream =
        ContentStream::over_runs(reader, volume, runs, offset + len as u64, Some(offset..offset + len as u64));
    for chunk in stream {
        out.extend_from_slice(chunk?);
    }
    if out.len() != len {
        return Err(EntryError::ShortRead {
            obtained: out.len() as u64,
            expected: len as u64,
        });
    }
    Ok(out)
}
