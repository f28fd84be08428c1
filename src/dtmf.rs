//! Telephony event queue.
//!
//! Start and stop requests are queued and pushed to the RTP muxer one at a
//! time. The head is only popped once the source that handled it confirms
//! with a processed message.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bus::Event;

/// How a telephony event is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtmfMethod {
    /// Named events, RFC 4733.
    Rfc4733,
    /// In-band tones in the audio codec.
    InBand,
}

impl DtmfMethod {
    /// Numeric value carried in the event structure.
    pub fn as_u8(&self) -> u8 {
        match self {
            DtmfMethod::Rfc4733 => 1,
            DtmfMethod::InBand => 2,
        }
    }
}

impl fmt::Display for DtmfMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DtmfMethod::Rfc4733 => write!(f, "rfc4733"),
            DtmfMethod::InBand => write!(f, "in-band"),
        }
    }
}

/// One start or stop request as pushed upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfEvent {
    pub start: bool,
    pub method: DtmfMethod,
    /// Event number, `[0, 15]` for DTMF digits.
    pub number: u8,
    pub volume: u8,
}

/// Queue of pending telephony events.
#[derive(Debug, Default)]
pub struct DtmfQueue {
    queue: VecDeque<DtmfEvent>,
    /// Whether the last accepted request was a start.
    started: bool,
    /// The head has been pushed and awaits confirmation.
    in_flight: bool,
    /// Method of the event that is currently playing.
    playing: Option<DtmfMethod>,
}

impl DtmfQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a start. Returns false if the previous start was not stopped.
    pub fn start(&mut self, number: u8, volume: u8) -> bool {
        if self.started {
            warn!("Telephony event {} started before the previous was stopped", number);
            return false;
        }
        self.started = true;
        self.queue.push_back(DtmfEvent {
            start: true,
            method: DtmfMethod::Rfc4733,
            number,
            volume,
        });
        true
    }

    /// Queue a stop. Returns false if nothing was started.
    pub fn stop(&mut self) -> bool {
        if !self.started {
            warn!("Telephony event stopped without a start");
            return false;
        }
        self.started = false;
        self.queue.push_back(DtmfEvent {
            start: false,
            method: DtmfMethod::Rfc4733,
            number: 0,
            volume: 0,
        });
        true
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Push the head upstream if nothing is in flight.
    pub fn deliver(&mut self, send: &dyn Fn(&DtmfEvent) -> bool, events: &mut Vec<Event>) {
        while !self.in_flight {
            let Some(head) = self.queue.front_mut() else {
                return;
            };

            head.method = if head.start {
                DtmfMethod::Rfc4733
            } else {
                self.playing.unwrap_or(DtmfMethod::Rfc4733)
            };

            if send(head) {
                self.in_flight = true;
                return;
            }

            if head.start && head.method == DtmfMethod::Rfc4733 {
                head.method = DtmfMethod::InBand;
                if send(head) {
                    self.in_flight = true;
                    return;
                }
            }

            let head = *head;
            debug!("No element took {:?}", head);
            self.abandon(head, events);
        }
    }

    /// A source confirmed an event.
    pub fn handle_processed(&mut self, ev: &DtmfEvent, send: &dyn Fn(&DtmfEvent) -> bool, events: &mut Vec<Event>) {
        if !self.is_head(ev) {
            warn!("Processed message for an event not in flight: {:?}", ev);
            return;
        }

        self.queue.pop_front();
        self.in_flight = false;

        if ev.start {
            self.playing = Some(ev.method);
            info!("Telephony event {} started ({})", ev.number, ev.method);
            events.push(Event::TelephonyEventStarted {
                method: ev.method,
                event: ev.number,
                volume: ev.volume,
            });
        } else {
            self.playing = None;
            info!("Telephony event stopped ({})", ev.method);
            events.push(Event::TelephonyEventStopped { method: ev.method });
        }

        self.deliver(send, events);
    }

    /// A source refused an event.
    pub fn handle_dropped(&mut self, ev: &DtmfEvent, send: &dyn Fn(&DtmfEvent) -> bool, events: &mut Vec<Event>) {
        if !self.is_head(ev) {
            warn!("Dropped message for an event not in flight: {:?}", ev);
            return;
        }

        self.in_flight = false;

        if let Some(head) = self.queue.front_mut() {
            if head.start && head.method == DtmfMethod::Rfc4733 {
                head.method = DtmfMethod::InBand;
                if send(head) {
                    self.in_flight = true;
                    return;
                }
            }
        }

        self.abandon(*ev, events);
        self.deliver(send, events);
    }

    fn is_head(&self, ev: &DtmfEvent) -> bool {
        let Some(head) = self.queue.front() else {
            return false;
        };
        self.in_flight
            && head.start == ev.start
            && head.method == ev.method
            && (!ev.start || (head.number == ev.number && head.volume == ev.volume))
    }

    fn abandon(&mut self, ev: DtmfEvent, events: &mut Vec<Event>) {
        self.queue.pop_front();

        if ev.start {
            // The matching stop has nothing to stop.
            if self.queue.front().map(|e| !e.start).unwrap_or(false) {
                self.queue.pop_front();
            } else {
                self.started = false;
            }
            warn!("Telephony event {} could not be started", ev.number);
        } else {
            self.playing = None;
            events.push(Event::TelephonyEventStopped { method: ev.method });
        }
    }
}
