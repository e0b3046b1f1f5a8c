//! Announcement-driven fetchers.
//!
//! Both fetchers are actors: a task owns all state and is driven by a
//! command channel plus its own timers, callers hold cloneable handles.

mod block;
mod tx;

pub use block::{
    BlockAnnounce, BlockFetcher, BlockFetcherStats, BlockFetcherTask, BodyRequester,
    HeaderRequester,
};
pub use tx::{TxFetcher, TxFetcherStats, TxFetcherTask, TxRequester};

use rand::Rng;
use std::time::Duration;

/// Random spread in `[0, slack]` added to arrival timers.
fn jitter(slack: Duration) -> Duration {
    let millis = slack.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}
