//! Incoming SSRC bookkeeping.
//!
//! Every SSRC the RTP session demultiplexes becomes a substream. A substream
//! is owned by at most one stream. Until one is found it sits in the free
//! list, possibly with a deadline after which it is handed to the only
//! stream of the session.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::codec::{Caps, Codec};
use crate::id::{BinId, Pt, Ssrc, StreamId};

/// One incoming SSRC.
#[derive(Debug, Clone)]
pub(crate) struct Substream {
    pub ssrc: Ssrc,
    pub pt: Pt,
    /// Receive bin currently decoding.
    pub bin: Option<BinId>,
    /// Codec the bin was built for.
    pub codec: Option<Codec>,
    /// Caps the bin produces.
    pub caps: Option<Caps>,
    pub stream: Option<StreamId>,
    /// The stream has reported the substream to the application.
    pub announced: bool,
    /// When a free substream is given to the only stream.
    pub deadline: Option<Instant>,
}

impl Substream {
    fn new(ssrc: Ssrc, pt: Pt) -> Self {
        Substream {
            ssrc,
            pt,
            bin: None,
            codec: None,
            caps: None,
            stream: None,
            announced: false,
            deadline: None,
        }
    }
}

/// What happened to a new substream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// The SSRC belongs to a stream already.
    Stream(StreamId),
    /// Waiting for an SDES or the timeout.
    Parked,
}

/// Routing of incoming SSRCs to streams.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    no_rtcp_timeout: Option<Duration>,
    substreams: Vec<Substream>,
    ssrc_streams: HashMap<Ssrc, StreamId>,
    /// SSRCs the application added itself. They survive a BYE.
    manual: HashSet<Ssrc>,
}

impl Dispatcher {
    pub fn new(no_rtcp_timeout: Option<Duration>) -> Self {
        Dispatcher {
            no_rtcp_timeout,
            substreams: vec![],
            ssrc_streams: HashMap::new(),
            manual: HashSet::new(),
        }
    }

    pub fn get(&self, ssrc: Ssrc) -> Option<&Substream> {
        self.substreams.iter().find(|s| s.ssrc == ssrc)
    }

    pub fn get_mut(&mut self, ssrc: Ssrc) -> Option<&mut Substream> {
        self.substreams.iter_mut().find(|s| s.ssrc == ssrc)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Substream> {
        self.substreams.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Substream> {
        self.substreams.iter_mut()
    }

    /// Substreams owned by `stream`.
    pub fn of_stream(&self, stream: StreamId) -> impl Iterator<Item = &Substream> {
        self.substreams.iter().filter(move |s| s.stream == Some(stream))
    }

    pub fn has_free(&self) -> bool {
        self.substreams.iter().any(|s| s.stream.is_none())
    }

    pub fn stream_of(&self, ssrc: Ssrc) -> Option<StreamId> {
        self.ssrc_streams.get(&ssrc).copied()
    }

    /// Every SSRC known to belong to `stream`, bound or decoding.
    pub fn ssrcs_of(&self, stream: StreamId) -> Vec<Ssrc> {
        let mut v: Vec<Ssrc> = self
            .ssrc_streams
            .iter()
            .filter(|(_, s)| **s == stream)
            .map(|(ssrc, _)| *ssrc)
            .chain(self.of_stream(stream).map(|s| s.ssrc))
            .collect();
        v.sort_unstable();
        v.dedup();
        v
    }

    /// Record a new SSRC and decide where it goes.
    pub fn add(&mut self, ssrc: Ssrc, pt: Pt, now: Instant, streams: &[StreamId]) -> Placement {
        let mut sub = Substream::new(ssrc, pt);

        let placement = if let Some(stream) = self.ssrc_streams.get(&ssrc) {
            Placement::Stream(*stream)
        } else if self.no_rtcp_timeout == Some(Duration::ZERO) && streams.len() == 1 {
            Placement::Stream(streams[0])
        } else {
            match self.no_rtcp_timeout {
                Some(t) if t > Duration::ZERO => {
                    trace!("Substream {} waits {:?} for an SDES", ssrc, t);
                    sub.deadline = Some(now + t);
                }
                Some(_) => {
                    warn!(
                        "No RTCP timeout is zero but there are {} streams, waiting for an SDES for {}",
                        streams.len(),
                        ssrc
                    );
                }
                None => {
                    trace!("Substream {} waits for an SDES", ssrc);
                }
            }
            Placement::Parked
        };

        if let Placement::Stream(s) = placement {
            sub.stream = Some(s);
        }

        self.substreams.push(sub);
        placement
    }

    /// Bind an SSRC to a stream. Returns the free substreams that moved to
    /// it.
    ///
    /// An SSRC stays with the first stream it was bound to until a BYE or
    /// the removal of that stream.
    pub fn add_ssrc_stream(&mut self, ssrc: Ssrc, stream: StreamId, manual: bool) -> Vec<Ssrc> {
        if let Some(prev) = self.ssrc_streams.get(&ssrc) {
            if *prev != stream {
                warn!("SSRC {} already belongs to stream {}, not binding to {}", ssrc, prev, stream);
                return vec![];
            }
        }

        if manual {
            self.manual.insert(ssrc);
        }
        self.ssrc_streams.insert(ssrc, stream);

        self.claim_free(ssrc, stream)
    }

    fn claim_free(&mut self, ssrc: Ssrc, stream: StreamId) -> Vec<Ssrc> {
        let mut moved = vec![];
        for s in self.substreams.iter_mut() {
            if s.ssrc == ssrc && s.stream.is_none() {
                s.stream = Some(stream);
                s.deadline = None;
                moved.push(s.ssrc);
            }
        }
        moved
    }

    /// An RTCP BYE. Manual bindings are kept.
    pub fn bye(&mut self, ssrc: Ssrc) -> bool {
        if self.manual.contains(&ssrc) {
            trace!("Keeping manual SSRC {} after BYE", ssrc);
            return false;
        }
        self.ssrc_streams.remove(&ssrc).is_some()
    }

    /// Remove a substream, returning it.
    pub fn remove(&mut self, ssrc: Ssrc) -> Option<Substream> {
        let idx = self.substreams.iter().position(|s| s.ssrc == ssrc)?;
        Some(self.substreams.remove(idx))
    }

    /// Forget a stream. Its substreams are returned for teardown.
    pub fn remove_stream(&mut self, stream: StreamId) -> Vec<Substream> {
        self.ssrc_streams.retain(|_, s| *s != stream);
        let (gone, keep) = std::mem::take(&mut self.substreams)
            .into_iter()
            .partition(|s| s.stream == Some(stream));
        self.substreams = keep;
        gone
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.substreams
            .iter()
            .filter(|s| s.stream.is_none())
            .filter_map(|s| s.deadline)
            .min()
    }

    /// Expire deadlines. Free substreams whose deadline passed go to the
    /// only stream. With any other number of streams they stay parked.
    pub fn handle_timeout(&mut self, now: Instant, streams: &[StreamId]) -> Vec<(Ssrc, StreamId)> {
        let mut moved = vec![];

        for s in self.substreams.iter_mut() {
            if s.stream.is_some() {
                continue;
            }
            let Some(deadline) = s.deadline else {
                continue;
            };
            if deadline > now {
                continue;
            }
            s.deadline = None;

            if streams.len() != 1 {
                warn!(
                    "No RTCP received for {} but there are {} streams, not associating",
                    s.ssrc,
                    streams.len()
                );
                continue;
            }

            debug!("No RTCP received for {}, giving it to stream {}", s.ssrc, streams[0]);
            s.stream = Some(streams[0]);
            moved.push((s.ssrc, streams[0]));
        }

        moved
    }

    pub fn clear(&mut self) -> Vec<Substream> {
        self.ssrc_streams.clear();
        self.manual.clear();
        std::mem::take(&mut self.substreams)
    }
}
