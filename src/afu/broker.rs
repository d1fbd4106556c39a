//! Tag and credit broker.
//!
//! Owns the correlation-tag pool and the four outbound flow-control
//! channels. Pure bookkeeping, no I/O: callers take a credit before putting
//! anything on the wire and give credits back as the link partner returns
//! them.
//!
//! Exhaustion (no tag, no credit) is expected backpressure and is reported
//! through the return value. Misuse, such as releasing a tag that was never
//! allocated or returning more credit than the channel can hold, is an
//! internal consistency failure and panics with a diagnostic.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Number of correlation tags on the link (8-bit tag field).
pub const TAG_COUNT: usize = 256;

/// Default local send-credit ceiling (concurrent outstanding tags).
pub const DEFAULT_SEND_CREDITS: u32 = 64;

/// The four independently throttled outbound channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditChannel {
    Command,
    Response,
    CommandData,
    ResponseData,
}

impl CreditChannel {
    #[inline]
    fn index(self) -> usize {
        match self {
            CreditChannel::Command => 0,
            CreditChannel::Response => 1,
            CreditChannel::CommandData => 2,
            CreditChannel::ResponseData => 3,
        }
    }
}

/// One bounded credit counter.
#[derive(Debug, Clone, Copy, Default)]
struct CreditPool {
    available: u32,
    max: u32,
}

/// Tag pool plus the four channel counters.
pub struct TagBroker {
    in_use: [bool; TAG_COUNT],
    in_use_count: usize,
    send_credits: u32,
    send_credit_max: u32,
    channels: [CreditPool; 4],
    rng: StdRng,
}

impl TagBroker {
    /// Create a broker with the given local send-credit ceiling. Channel
    /// counters stay at zero until [`init_link_credits`] runs.
    ///
    /// [`init_link_credits`]: TagBroker::init_link_credits
    pub fn new(send_credit_max: u32, seed: u64) -> Self {
        Self {
            in_use: [false; TAG_COUNT],
            in_use_count: 0,
            send_credits: send_credit_max,
            send_credit_max,
            channels: [CreditPool::default(); 4],
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Allocate an unused tag, drawn pseudo-randomly from the free set.
    /// Returns `None` when no local send-credit remains or every tag is in
    /// use; both are backpressure, retry a later cycle.
    pub fn allocate_tag(&mut self) -> Option<u8> {
        if self.send_credits == 0 || self.in_use_count == TAG_COUNT {
            return None;
        }
        let start = self.rng.gen_range(0..TAG_COUNT);
        for i in 0..TAG_COUNT {
            let tag = (start + i) % TAG_COUNT;
            if !self.in_use[tag] {
                self.in_use[tag] = true;
                self.in_use_count += 1;
                self.send_credits -= 1;
                log::trace!("allocated tag {} ({} in use)", tag, self.in_use_count);
                return Some(tag as u8);
            }
        }
        unreachable!("free tag must exist when in_use_count < TAG_COUNT");
    }

    /// Release a tag after its terminal response was fully processed.
    ///
    /// # Panics
    ///
    /// Panics if the tag is not currently in use.
    pub fn release_tag(&mut self, tag: u8) {
        let idx = tag as usize;
        if !self.in_use[idx] {
            panic!("release of tag {} that is not in use", tag);
        }
        self.in_use[idx] = false;
        self.in_use_count -= 1;
        self.send_credits += 1;
        log::trace!("released tag {} ({} in use)", tag, self.in_use_count);
    }

    /// True when the tag is currently allocated.
    #[inline]
    pub fn tag_in_use(&self, tag: u8) -> bool {
        self.in_use[tag as usize]
    }

    /// Number of tags currently allocated.
    #[inline]
    pub fn tags_in_use(&self) -> usize {
        self.in_use_count
    }

    /// Drop all tag state and restore the local send-credit ceiling. The
    /// channel counters are cleared as well; the next initial-credit
    /// announcement reseeds them.
    pub fn reset(&mut self) {
        self.in_use = [false; TAG_COUNT];
        self.in_use_count = 0;
        self.send_credits = self.send_credit_max;
        self.channels = [CreditPool::default(); 4];
        log::debug!("broker reset, send credits back to {}", self.send_credit_max);
    }

    /// Seed the four channel counters from the link partner's announced
    /// capacity: command and command-data get `cmd_max`, response and
    /// response-data get `data_max`.
    pub fn init_link_credits(&mut self, cmd_max: u32, data_max: u32) {
        let seeds = [cmd_max, data_max, cmd_max, data_max];
        for (pool, &max) in self.channels.iter_mut().zip(&seeds) {
            pool.available = max;
            pool.max = max;
        }
        log::info!("link credits seeded: cmd={} data={}", cmd_max, data_max);
    }

    /// Take one credit from a channel. Returns false (and takes nothing)
    /// when the channel is dry; the caller must not send.
    pub fn try_take(&mut self, channel: CreditChannel) -> bool {
        let pool = &mut self.channels[channel.index()];
        if pool.available == 0 {
            return false;
        }
        pool.available -= 1;
        true
    }

    /// Return one credit to a channel if it sits below its maximum. Used
    /// for credit flags observed on the link, which can be stale after a
    /// device reset reseeded the counters; a stale flag is dropped and
    /// reported as false.
    pub fn try_give_back(&mut self, channel: CreditChannel) -> bool {
        let pool = &mut self.channels[channel.index()];
        if pool.available >= pool.max {
            return false;
        }
        pool.available += 1;
        true
    }

    /// Return one credit taken locally this cycle (rollback of a matched
    /// `try_take`).
    ///
    /// # Panics
    ///
    /// Panics if the counter would exceed the announced maximum.
    pub fn give_back(&mut self, channel: CreditChannel) {
        let pool = &mut self.channels[channel.index()];
        if pool.available >= pool.max {
            panic!(
                "credit over-return on {:?}: {} already at max",
                channel, pool.available
            );
        }
        pool.available += 1;
    }

    /// Current credit count for a channel.
    #[inline]
    pub fn credits(&self, channel: CreditChannel) -> u32 {
        self.channels[channel.index()].available
    }

    /// Remaining local send-credits (tags that may still be issued).
    #[inline]
    pub fn send_credits(&self) -> u32 {
        self.send_credits
    }
}

impl std::fmt::Debug for TagBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagBroker")
            .field("tags_in_use", &self.in_use_count)
            .field("send_credits", &self.send_credits)
            .field("cmd", &self.channels[0].available)
            .field("resp", &self.channels[1].available)
            .field("cmd_data", &self.channels[2].available)
            .field("resp_data", &self.channels[3].available)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocated_tags_are_unique() {
        let mut broker = TagBroker::new(TAG_COUNT as u32, 1);
        let mut seen = [false; TAG_COUNT];
        for _ in 0..TAG_COUNT {
            let tag = broker.allocate_tag().unwrap() as usize;
            assert!(!seen[tag], "tag {} handed out twice", tag);
            seen[tag] = true;
        }
        // Pool exhausted
        assert_eq!(broker.allocate_tag(), None);
    }

    #[test]
    fn test_send_credit_backpressure() {
        let mut broker = TagBroker::new(1, 2);
        let tag = broker.allocate_tag().unwrap();
        assert_eq!(broker.allocate_tag(), None);

        broker.release_tag(tag);
        assert!(broker.allocate_tag().is_some());
    }

    #[test]
    #[should_panic(expected = "not in use")]
    fn test_release_unallocated_tag_panics() {
        let mut broker = TagBroker::new(4, 3);
        broker.release_tag(17);
    }

    #[test]
    fn test_reset_then_init_seeds_all_channels() {
        let mut broker = TagBroker::new(8, 4);
        broker.init_link_credits(5, 3);
        assert!(broker.try_take(CreditChannel::Command));
        assert!(broker.try_take(CreditChannel::ResponseData));

        broker.reset();
        broker.init_link_credits(6, 2);
        assert_eq!(broker.credits(CreditChannel::Command), 6);
        assert_eq!(broker.credits(CreditChannel::Response), 2);
        assert_eq!(broker.credits(CreditChannel::CommandData), 6);
        assert_eq!(broker.credits(CreditChannel::ResponseData), 2);
    }

    #[test]
    fn test_try_take_never_goes_negative() {
        let mut broker = TagBroker::new(8, 5);
        broker.init_link_credits(2, 2);
        assert!(broker.try_take(CreditChannel::Response));
        assert!(broker.try_take(CreditChannel::Response));
        assert!(!broker.try_take(CreditChannel::Response));
        assert_eq!(broker.credits(CreditChannel::Response), 0);

        broker.give_back(CreditChannel::Response);
        assert!(broker.try_take(CreditChannel::Response));
    }

    #[test]
    #[should_panic(expected = "over-return")]
    fn test_give_back_past_max_panics() {
        let mut broker = TagBroker::new(8, 6);
        broker.init_link_credits(1, 1);
        broker.give_back(CreditChannel::Command);
    }

    #[test]
    fn test_try_give_back_drops_stale_credit() {
        let mut broker = TagBroker::new(8, 6);
        broker.init_link_credits(1, 1);
        // Counter already at max: the flag is stale, nothing changes
        assert!(!broker.try_give_back(CreditChannel::Command));
        assert_eq!(broker.credits(CreditChannel::Command), 1);

        assert!(broker.try_take(CreditChannel::Command));
        assert!(broker.try_give_back(CreditChannel::Command));
        assert_eq!(broker.credits(CreditChannel::Command), 1);
    }

    #[test]
    fn test_reset_clears_tags() {
        let mut broker = TagBroker::new(4, 7);
        let tag = broker.allocate_tag().unwrap();
        broker.reset();
        assert!(!broker.tag_in_use(tag));
        assert_eq!(broker.send_credits(), 4);
    }
}
