//! TCP friendly rate control (RFC 5348) for video sessions.
//!
//! The remote echoes the send timestamps carried in the rtt-sendts header
//! extension back in RTCP feedback, together with its receive rate and loss
//! event rate. Each report moves the allowed sending rate, which becomes the
//! encoder bitrate of the session.
//!
//! Rate control is only used for codecs that negotiated `a=rtcp-fb:* tfrc`
//! and key unit requests, and only when the rtt-sendts extension was agreed
//! on in both directions.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::assoc::AssociationTable;
use crate::codec::Codec;
use crate::dir::Direction;
use crate::hdrext::HeaderExtension;
use crate::id::{Pt, Ssrc};
use crate::keyunit::has_key_request_feedback;

/// Header extension carrying the send timestamp and the sender's RTT.
pub const RTT_SENDTS_URI: &str = "urn:ietf:params:rtp-hdrext:rtt-sendts";

const TFRC_FEEDBACK: &str = "tfrc";

/// Microseconds.
const SECOND: u64 = 1_000_000;

const DEFAULT_MSS: u64 = 1460;

const MIN_NOFEEDBACK_TIMER: u64 = 20_000;

/// Maximum backoff interval, in seconds.
const T_MBI: u64 = 64;

const RECEIVE_RATE_HISTORY: usize = 4;

const UNLIMITED: u64 = u64::MAX;

const ONE_32BIT_CYCLE: u64 = 1 << 32;

/// RTCP transport layer feedback.
const RTCP_RTPFB: u8 = 205;

/// Feedback message type of TFRC reports.
const TFRC_FMT: u8 = 2;

/// Throughput equation of RFC 5348 section 3.1 in bytes per second.
///
/// `s` is the segment size in bytes, `rtt` in microseconds and `p` the loss
/// event rate.
fn throughput(s: u64, rtt: u64, p: f64) -> u64 {
    let f = (2.0 * p / 3.0).sqrt() + 12.0 * (3.0 * p / 8.0).sqrt() * p * (1.0 + 32.0 * p * p);
    ((SECOND * s) as f64 / (rtt as f64 * f)) as u64
}

/// RFC 5348 section 4.2.
fn initial_rate(mss: u64, rtt: u64) -> u64 {
    if rtt == 0 {
        return 0;
    }
    SECOND * (4 * mss).min((2 * mss).max(4380)) / rtt
}

#[derive(Debug, Clone, Copy, Default)]
struct ReceiveRate {
    at: u64,
    rate: u64,
}

/// Sending side of TFRC. Times are microseconds on one clock, rates bytes
/// per second.
#[derive(Debug)]
pub(crate) struct TfrcSender {
    /// From the throughput equation.
    computed_rate: u64,
    /// Sixteen times the average packet size.
    average_packet_size: u64,
    mss: u64,
    /// Allowed sending rate.
    rate: u64,
    /// Rate corrected for the latest RTT sample.
    inst_rate: u64,
    averaged_rtt: u64,
    sqmean_rtt: u64,
    last_sqrt_rtt: u64,
    /// Time last doubled during slow start.
    tld: Option<u64>,
    nofeedback_expiry: u64,
    receive_rates: [ReceiveRate; RECEIVE_RATE_HISTORY],
    last_loss_event_rate: f64,
    sent_packet: bool,
}

impl TfrcSender {
    pub fn new(segment_size: u64, now: u64, initial: u64) -> Self {
        TfrcSender {
            computed_rate: 0,
            average_packet_size: segment_size << 4,
            mss: DEFAULT_MSS,
            rate: if initial > 0 { initial } else { segment_size },
            inst_rate: 0,
            averaged_rtt: 0,
            sqmean_rtt: 0,
            last_sqrt_rtt: 0,
            tld: None,
            nofeedback_expiry: now + 2 * SECOND,
            receive_rates: [ReceiveRate::default(); RECEIVE_RATE_HISTORY],
            last_loss_event_rate: 0.0,
            sent_packet: false,
        }
    }

    fn segment_size(&self) -> u64 {
        self.average_packet_size >> 4
    }

    fn min_rate(&self) -> u64 {
        self.segment_size() / T_MBI
    }

    pub fn averaged_rtt(&self) -> u64 {
        self.averaged_rtt
    }

    pub fn nofeedback_expiry(&self) -> u64 {
        self.nofeedback_expiry
    }

    /// The receive rate limit is lifted until the first report after the
    /// first RTT sample.
    pub fn on_first_rtt(&mut self, now: u64) {
        self.receive_rates[0] = ReceiveRate { at: now, rate: UNLIMITED };
    }

    fn max_receive_rate(&self) -> u64 {
        self.receive_rates.iter().map(|r| r.rate).max().unwrap_or(0)
    }

    fn push_receive_rate(&mut self, rate: u64, now: u64) {
        self.receive_rates.rotate_right(1);
        self.receive_rates[0] = ReceiveRate { at: now, rate };

        let horizon = now.saturating_sub(2 * self.averaged_rtt);
        for r in self.receive_rates.iter_mut().skip(1) {
            if r.rate != 0 && r.at < horizon {
                r.rate = 0;
            }
        }
    }

    fn timeout_interval(&self) -> u64 {
        let per_packet = SECOND * 2 * self.segment_size() / self.rate.max(1);
        (4 * self.averaged_rtt).max(per_packet).max(MIN_NOFEEDBACK_TIMER)
    }

    /// Step 4 of RFC 5348 section 4.3.
    fn recompute_rate(&mut self, recv_limit: u64, loss_event_rate: f64, now: u64) {
        if loss_event_rate > 0.0 {
            self.computed_rate = throughput(self.segment_size(), self.averaged_rtt, loss_event_rate);
            self.rate = self.computed_rate.min(recv_limit).max(self.min_rate());
            trace!("TFRC congestion avoidance: {} (computed {})", self.rate, self.computed_rate);
        } else if now.saturating_sub(self.tld.unwrap_or(0)) >= self.averaged_rtt {
            let doubled = self.rate.saturating_mul(2).min(recv_limit);
            self.rate = doubled.max(initial_rate(self.mss, self.averaged_rtt));
            self.tld = Some(now);
            trace!("TFRC slow start: {}", self.rate);
        }
    }

    /// RFC 5348 section 4.5.
    fn update_inst_rate(&mut self) {
        if self.last_sqrt_rtt == 0 {
            return;
        }

        self.sqmean_rtt = if self.sqmean_rtt > 0 {
            (0.9 * self.sqmean_rtt as f64 + self.last_sqrt_rtt as f64 / 10.0) as u64
        } else {
            self.last_sqrt_rtt
        };

        self.inst_rate = (self.rate * self.sqmean_rtt / self.last_sqrt_rtt).max(self.min_rate());
    }

    /// A feedback report arrived. `rtt` is in microseconds, `receive_rate`
    /// in bytes per second.
    pub fn on_feedback(&mut self, now: u64, rtt: u64, receive_rate: u64, loss_event_rate: f64) {
        if rtt == 0 || rtt > 10 * SECOND {
            return;
        }

        if self.tld.is_none() {
            self.rate = initial_rate(self.mss, rtt);
            self.tld = Some(now);
        }

        self.averaged_rtt = if self.averaged_rtt == 0 {
            rtt
        } else {
            (self.averaged_rtt * 9 + rtt) / 10
        }
        .max(1);

        self.push_receive_rate(receive_rate, now);
        let recv_limit = match self.max_receive_rate() {
            r if r < UNLIMITED / 2 => r * 2,
            _ => UNLIMITED,
        };

        self.recompute_rate(recv_limit, loss_event_rate, now);

        self.last_sqrt_rtt = (rtt as f64).sqrt() as u64;
        self.update_inst_rate();

        self.nofeedback_expiry = now + self.timeout_interval();
        self.sent_packet = false;
        self.last_loss_event_rate = loss_event_rate;
    }

    fn limit_to(&mut self, limit: u64, now: u64) {
        let limit = limit.max(self.min_rate());

        self.receive_rates = [ReceiveRate::default(); RECEIVE_RATE_HISTORY];
        self.receive_rates[0] = ReceiveRate { at: now, rate: limit / 2 };

        self.recompute_rate(limit, self.last_loss_event_rate, now);
    }

    fn halve_rate(&mut self) {
        self.rate = (self.rate / 2).max(self.min_rate());
        self.update_inst_rate();
    }

    /// RFC 5348 section 4.4.
    pub fn on_nofeedback_timer(&mut self, now: u64) {
        let receive_rate = self.max_receive_rate();
        let recover_rate = initial_rate(self.mss, self.averaged_rtt);
        let p = self.last_loss_event_rate;

        if self.averaged_rtt == 0 && self.sent_packet {
            self.halve_rate();
            trace!("TFRC no feedback before any RTT, rate {}", self.rate);
        } else if ((p > 0.0 && receive_rate < recover_rate) || (p == 0.0 && self.rate < 2 * recover_rate))
            && !self.sent_packet
        {
            trace!("TFRC idle, keeping rate {}", self.rate);
        } else if p == 0.0 {
            self.halve_rate();
            trace!("TFRC no feedback without loss, rate {}", self.rate);
        } else if self.computed_rate / 2 > receive_rate {
            self.limit_to(receive_rate, now);
        } else {
            self.limit_to(self.computed_rate / 2, now);
        }

        self.nofeedback_expiry = now + self.timeout_interval();
        self.sent_packet = false;
    }

    pub fn sending_packet(&mut self, size: u64) {
        self.average_packet_size = size + ((15 * self.average_packet_size) >> 4);
        self.sent_packet = true;
    }

    /// Allowed sending rate in bytes per second.
    pub fn send_rate(&self) -> u64 {
        if self.inst_rate > 0 {
            self.inst_rate
        } else {
            self.rate
        }
    }
}

/// A TFRC feedback report (RTCP RTPFB, FMT 2).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TfrcReport {
    pub sender_ssrc: Ssrc,
    pub media_ssrc: Ssrc,
    /// Lower 32 bits of the newest send timestamp the remote received.
    pub timestamp: u32,
    /// Microseconds between receiving that packet and sending the report.
    pub delay: u32,
    /// Receive rate in bytes per second.
    pub receive_rate: u32,
    pub loss_event_rate: f64,
}

impl TfrcReport {
    /// Parse one RTCP packet. `None` if it is not a TFRC report.
    pub fn parse(buf: &[u8]) -> Option<TfrcReport> {
        if buf.len() < 28 {
            return None;
        }

        let version = buf[0] >> 6;
        let fmt = buf[0] & 0x1f;
        let length = u16::from_be_bytes([buf[2], buf[3]]);

        if version != 2 || fmt != TFRC_FMT || buf[1] != RTCP_RTPFB || length != 6 {
            return None;
        }

        let word = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);

        Some(TfrcReport {
            sender_ssrc: word(4).into(),
            media_ssrc: word(8).into(),
            timestamp: word(12),
            delay: word(16),
            receive_rate: word(20),
            loss_event_rate: word(24) as f64 / u32::MAX as f64,
        })
    }
}

#[derive(Debug)]
struct TrackedSource {
    sender: TfrcSender,
    /// Newest echoed timestamp, unwrapped.
    fb_last_ts: Option<u64>,
}

/// Rate control of one session, with one sender state per remote that
/// sends reports.
#[derive(Debug)]
pub(crate) struct TfrcController {
    epoch: Option<Instant>,
    pts: HashSet<Pt>,
    extension_id: Option<u16>,
    sources: HashMap<Ssrc, TrackedSource>,
    last_src: Option<Ssrc>,
    /// Bits per second.
    bitrate: u32,
    sending: bool,
}

impl TfrcController {
    pub fn new() -> Self {
        TfrcController {
            epoch: None,
            pts: HashSet::new(),
            extension_id: None,
            sources: HashMap::new(),
            last_src: None,
            bitrate: (DEFAULT_MSS * 8) as u32,
            sending: false,
        }
    }

    /// Microseconds since the first time the controller saw the clock.
    fn clock(&mut self, now: Instant) -> u64 {
        let epoch = *self.epoch.get_or_insert(now);
        now.saturating_duration_since(epoch).as_micros() as u64
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    pub fn set_sending(&mut self, sending: bool) {
        self.sending = sending;
    }

    /// Take note of which payload types may use rate control.
    pub fn codecs_updated(&mut self, table: &AssociationTable, hdrext: &[HeaderExtension]) {
        self.pts = table
            .iter()
            .filter(|a| a.is_live() && has_tfrc_feedback(&a.codec) && has_key_request_feedback(&a.codec))
            .filter_map(|a| a.pt())
            .collect();

        self.extension_id = hdrext
            .iter()
            .find(|h| h.uri == RTT_SENDTS_URI && h.direction == Direction::SendRecv)
            .map(|h| h.id);

        debug!("TFRC extension {:?} for pts {:?}", self.extension_id, self.pts);
    }

    pub fn is_enabled(&self, pt: Pt) -> bool {
        self.extension_id.is_some() && self.pts.contains(&pt)
    }

    fn is_active(&self) -> bool {
        self.extension_id.is_some() && !self.pts.is_empty()
    }

    /// Header extension for an outgoing RTP packet of `size` bytes: 24 bits
    /// of averaged RTT then 32 bits of send timestamp.
    pub fn outgoing_packet(&mut self, size: usize, now: Instant) -> Option<(u16, [u8; 7])> {
        let id = self.extension_id?;
        if !self.sending {
            return None;
        }

        let clock = self.clock(now);

        let rtt = match self.last_src.and_then(|s| self.sources.get_mut(&s)) {
            Some(src) => {
                src.sender.sending_packet(size as u64);
                src.sender.averaged_rtt()
            }
            None => 0,
        };

        let mut data = [0; 7];
        data[..3].copy_from_slice(&(rtt.min(0xff_ffff) as u32).to_be_bytes()[1..]);
        data[3..].copy_from_slice(&(clock as u32).to_be_bytes());

        Some((id, data))
    }

    /// Handle a report. Returns the new bitrate if it changed.
    pub fn handle_report(&mut self, local_ssrc: Ssrc, report: &TfrcReport, now: Instant) -> Option<u32> {
        if report.media_ssrc != local_ssrc || !self.sending || !self.is_active() {
            return None;
        }

        let clock = self.clock(now);
        let initial = self.bitrate as u64 / 8;

        let src = self.sources.entry(report.sender_ssrc).or_insert_with(|| TrackedSource {
            sender: TfrcSender::new(DEFAULT_MSS, clock, initial),
            fb_last_ts: None,
        });

        let ts = unwrap_timestamp(report.timestamp, clock);

        if src.fb_last_ts.map(|last| ts < last).unwrap_or(false) {
            debug!("Ignoring reordered TFRC report from {}", report.sender_ssrc);
            return None;
        }
        src.fb_last_ts = Some(ts);

        let delay = report.delay as u64;
        if ts + delay > clock {
            debug!(
                "Ignoring TFRC report, timestamp {} and delay {} after now {}",
                ts, delay, clock
            );
            return None;
        }

        let rtt = (clock - ts - delay).max(1);
        if rtt > 10 * SECOND {
            warn!("Impossible RTT {}us, ignoring", rtt);
            return None;
        }

        if src.sender.averaged_rtt() == 0 {
            src.sender.on_first_rtt(clock);
        }

        src.sender
            .on_feedback(clock, rtt, report.receive_rate as u64, report.loss_event_rate);

        if src.sender.nofeedback_expiry() <= clock {
            src.sender.on_nofeedback_timer(clock);
        }

        self.last_src = Some(report.sender_ssrc);
        self.update_bitrate("feedback")
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        if !self.sending {
            return None;
        }
        let epoch = self.epoch?;
        self.sources
            .values()
            .map(|s| s.sender.nofeedback_expiry())
            .min()
            .map(|us| epoch + Duration::from_micros(us))
    }

    /// Run the no feedback timers that expired.
    pub fn handle_timeout(&mut self, now: Instant) -> Option<u32> {
        if !self.sending || self.sources.is_empty() {
            return None;
        }

        let clock = self.clock(now);
        for src in self.sources.values_mut() {
            if src.sender.nofeedback_expiry() <= clock {
                src.sender.on_nofeedback_timer(clock);
            }
        }

        self.update_bitrate("timer")
    }

    fn update_bitrate(&mut self, reason: &str) -> Option<u32> {
        let byterate = self
            .last_src
            .and_then(|s| self.sources.get(&s))
            .map(|s| s.sender.send_rate())
            .unwrap_or(DEFAULT_MSS);

        let bitrate = byterate.saturating_mul(8).min(u32::MAX as u64) as u32;

        if bitrate == self.bitrate {
            return None;
        }

        debug!("TFRC send rate changed ({}): {} -> {}", reason, self.bitrate, bitrate);
        self.bitrate = bitrate;
        Some(bitrate)
    }
}

/// Place the lower 32 bits of an echoed timestamp on the full clock.
fn unwrap_timestamp(ts: u32, clock: u64) -> u64 {
    let ts = (clock & !(ONE_32BIT_CYCLE - 1)) | ts as u64;
    if ts > clock && ts >= ONE_32BIT_CYCLE {
        ts - ONE_32BIT_CYCLE
    } else {
        ts
    }
}

fn has_tfrc_feedback(codec: &Codec) -> bool {
    codec
        .feedback()
        .iter()
        .any(|f| f.kind.eq_ignore_ascii_case(TFRC_FEEDBACK))
}

/// Keep rate control consistent after negotiation.
///
/// The rtt-sendts extension goes away when no sendable codec uses tfrc
/// feedback, and so do duplicates of it. If no codec is left with it in
/// both directions, tfrc feedback is removed from every codec.
pub(crate) fn filter_codecs(
    mut table: AssociationTable,
    hdrext: Vec<HeaderExtension>,
) -> (AssociationTable, Vec<HeaderExtension>) {
    let has_feedback = table
        .iter()
        .any(|a| a.is_valid_for_sending() && has_tfrc_feedback(&a.codec));

    let mut has_extension = false;
    let hdrext: Vec<HeaderExtension> = hdrext
        .into_iter()
        .filter(|h| {
            if h.uri != RTT_SENDTS_URI {
                return true;
            }
            if has_extension || !has_feedback {
                warn!("Removing {} without tfrc feedback or duplicated", RTT_SENDTS_URI);
                return false;
            }
            if h.direction == Direction::SendRecv {
                has_extension = true;
            }
            true
        })
        .collect();

    if has_feedback && !has_extension {
        for a in table.iter_mut() {
            if has_tfrc_feedback(&a.codec) {
                warn!("Removing tfrc from {} without {}", a.codec, RTT_SENDTS_URI);
            }
            a.codec.retain_feedback(|f| !f.kind.eq_ignore_ascii_case(TFRC_FEEDBACK));
            a.send_codec.retain_feedback(|f| !f.kind.eq_ignore_ascii_case(TFRC_FEEDBACK));
        }
    }

    (table, hdrext)
}
