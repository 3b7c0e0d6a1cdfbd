// src/tsbpd.rs
//! The scheduled-delivery task. One runs per receiving connection with
//! TsbPD enabled: it sleeps until the next play-out deadline (or until an
//! ACK or arrival changes the picture), drops too-late gaps, and wakes the
//! reader when the head packet is due.

use crate::connection::Core;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep_until, timeout};
use tracing::{debug, trace};

enum Next {
    /// Sleep until the given absolute deadline.
    Deadline(Instant),
    /// Nothing due; wait for a signal.
    Signal,
}

pub(crate) async fn run(core: Arc<Core>) {
    let link = core.link_copy();
    debug!(
        "[{}] TsbPD scheduler started (latency {:?}, enabled {})",
        core.id, link.rcv_tsbpd_delay, link.rcv_tsbpd
    );
    loop {
        if core.is_closing() {
            break;
        }
        let now = Instant::now();
        let next = evaluate(&core, now).await;
        match next {
            Next::Deadline(at) => {
                tokio::select! {
                    _ = sleep_until(at.into()) => {}
                    _ = core.tsbpd_cv.notified() => {}
                }
            }
            Next::Signal => {
                // Bounded so a wakeup racing the evaluation is only ever
                // one SYN interval late.
                let _ = timeout(crate::SYN_INTERVAL, core.tsbpd_cv.notified()).await;
            }
        }
    }
    debug!("[{}] TsbPD scheduler exit", core.id);
}

async fn evaluate(core: &Arc<Core>, now: Instant) -> Next {
    let tlpktdrop = core.opts.lock().unwrap().tlpktdrop;
    let mut rcv = core.rcv.lock().await;
    let rcv = &mut *rcv;

    let Some(r) = rcv.buf.next_readiness(now, &rcv.clock) else {
        return Next::Signal;
    };
    if !r.ready {
        return match r.play_time {
            Some(t) => Next::Deadline(t),
            None => Next::Signal,
        };
    }

    if let Some((skip_seq, n)) = r.skip_to {
        if !tlpktdrop {
            // The gap must be retransmitted; nothing to do until then.
            return Next::Signal;
        }
        // The deadline passed with unfilled slots in front: give the gap
        // up, advance the skip boundary and scrub the loss records.
        rcv.buf.skip(n);
        rcv.rcv_last_ack = rcv.buf.ack_seq();
        {
            let mut rl = core.rcv_loss.lock().await;
            rl.loss.remove_up_to(skip_seq);
            rl.belated.remove_up_to(skip_seq);
        }
        {
            let mut stats = core.stats.lock().unwrap();
            stats.pkt_rcv_drop += n as u64;
        }
        debug!(
            "[{}] Too-late drop: skipped {} slots to {}",
            core.id,
            n,
            skip_seq.raw()
        );
        // The packet now sits at the ACK boundary; the next ACK makes it
        // readable and signals us again.
        return Next::Signal;
    }

    if r.passack {
        // Ready but not yet covered by an ACK; wake on the next one.
        trace!("[{}] Packet {} ready but pass-ack", core.id, r.seq.raw());
        return Next::Signal;
    }

    // Due and acknowledged: hand it to the reader.
    core.rcv_data.notify_waiters();
    Next::Signal
}
