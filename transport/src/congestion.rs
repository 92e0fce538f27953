//! NewReno-style congestion control: slow start up to a loss-derived threshold, then linear
//!  congestion avoidance, halving the window on every detected loss. The window is counted in
//!  packets and shared by all streams of a connection.

use std::cmp::{max, min};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::{debug, trace};

const INITIAL_CWND: u32 = 10;
const MIN_CWND: u32 = 2;

#[derive(Debug)]
pub struct NewRenoCongestionControl {
    send_window_limit: u32,
    cwnd: u32,
    ssthresh: u32,
    cwnd_cnt: u32,
}

impl NewRenoCongestionControl {
    pub fn new(send_window_limit: u32) -> NewRenoCongestionControl {
        assert!(send_window_limit >= MIN_CWND);

        NewRenoCongestionControl {
            send_window_limit,
            cwnd: min(INITIAL_CWND, send_window_limit),
            ssthresh: send_window_limit,
            cwnd_cnt: 0,
        }
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    fn is_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    /// Grow the window in response to an acknowledged packet. Growth only happens when the
    ///  window is actually being used: an ACK arriving while the connection is mostly idle says
    ///  nothing about additional bandwidth (in the spirit of RFC 2861).
    pub fn on_ack(&mut self, num_packets_in_flight: u32) {
        if self.cwnd == self.send_window_limit {
            return;
        }

        if self.is_slow_start() {
            // during slow start we are lenient and grow at 50% utilization
            if self.cwnd > 2 * num_packets_in_flight {
                trace!("slow start - less than cwnd/2 packets in flight -> no adjustment");
                return;
            }
            self.cwnd += 1;
        }
        else {
            if self.cwnd > num_packets_in_flight {
                trace!("congestion avoidance - window not fully used -> no adjustment");
                return;
            }

            // one packet per round trip, approximated as one per cwnd ACKs
            self.cwnd_cnt += 1;
            if self.cwnd_cnt >= self.cwnd {
                self.cwnd_cnt = 0;
                self.cwnd += 1;
            }
        }

        self.cwnd = min(self.cwnd, self.send_window_limit);
        debug!("adjusted cwnd to {} packets", self.cwnd);
    }

    /// A lost packet halves the window and ends slow start at the halved size.
    pub fn on_loss(&mut self) {
        self.ssthresh = max(MIN_CWND, self.cwnd / 2);
        self.cwnd = self.ssthresh;
        self.cwnd_cnt = 0;

        debug!("loss -> adjusting cwnd downwards to {}", self.cwnd);
    }
}


/// The suspension point of the send path: `send` blocks here while the congestion window is
///  saturated and resumes when ACKs free up capacity.
pub struct CongestionGate {
    congestion: Mutex<NewRenoCongestionControl>,
    in_flight: AtomicU32,
    notify: Notify,
}

impl CongestionGate {
    pub fn new(send_window_limit: u32) -> CongestionGate {
        CongestionGate {
            congestion: Mutex::new(NewRenoCongestionControl::new(send_window_limit)),
            in_flight: AtomicU32::new(0),
            notify: Notify::new(),
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// reserve window capacity for one packet without waiting
    pub fn try_acquire(&self) -> bool {
        let cwnd = self.congestion.lock().unwrap().cwnd();
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_flight| {
                if in_flight < cwnd {
                    Some(in_flight + 1)
                }
                else {
                    None
                }
            })
            .is_ok()
    }

    /// reserve window capacity for one packet, cooperatively yielding while the window is full
    pub async fn acquire(&self) {
        loop {
            let notified = self.notify.notified();
            if self.try_acquire() {
                return;
            }
            notified.await;
        }
    }

    pub fn on_ack(&self, num_acked: u32) {
        let in_flight = self.in_flight.load(Ordering::Acquire);
        {
            let mut congestion = self.congestion.lock().unwrap();
            for _ in 0..num_acked {
                congestion.on_ack(in_flight);
            }
        }
        self.release(num_acked);
    }

    pub fn on_loss(&self) {
        self.congestion.lock().unwrap().on_loss();
        // NB: the lost packet stays in flight - it will be retransmitted, not dropped
        self.notify.notify_waiters();
    }

    /// return capacity without window adjustment, e.g. when a stream is torn down
    pub fn release(&self, num_packets: u32) {
        let mut remaining = num_packets;
        let _ = self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_flight| {
                remaining = min(remaining, in_flight);
                Some(in_flight - remaining)
            });
        self.notify.notify_waiters();
    }
}
