//! # recache - Shared, self-refreshing caches for push streams
//!
//! recache multiplexes many observers onto one expensive, time-bounded data
//! source. It is built from three layers:
//!
//! - **Multicast Proxy**: refcounted fan-out over one producer run at a time
//! - **Trigger-Repeat Combinator**: resubscribes a stream whenever a trigger
//!   stream emits, with the trigger either fixed or derived from the stream's
//!   own completion
//! - **Windowed Cache Operator**: repeats the producer after an expiration
//!   delay and replays its most recent values to late subscribers
//!
//! Everything runs on a single thread driven by a [`Scheduler`]. External
//! events from other threads enter through [`Scheduler::remote_channel`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use recache::{cache, CacheConfig, Callbacks, Scheduler, Stream};
//!
//! let scheduler = Scheduler::new();
//! let (refresh_tx, refresh) = scheduler.remote_channel::<()>();
//!
//! let prices = Stream::of([42]).pipe(
//!     cache(&scheduler, CacheConfig::new(Duration::from_secs(10))).refresher(refresh),
//! );
//!
//! prices.subscribe(Callbacks::new(|price| println!("price: {price}")));
//! refresh_tx.send(())?;
//! scheduler.run_for(Duration::from_secs(1));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Runtime
pub mod error;
pub mod scheduler;
pub mod stream;

// Combinators
pub mod cache;
pub mod config;
pub mod multicast;
pub mod repeat;

// Test doubles
pub mod testing;

// Re-export primary types at crate root for convenience
pub use cache::{cache, Cache, CacheState, CacheStatus};
pub use config::CacheConfig;
pub use error::{ConfigError, RecacheError, RecacheResult, RemoteError, StreamError};
pub use multicast::{ReplayBuffer, ReplayConfig, ReplayShared, SharedStream};
pub use repeat::{repeat_on_notifier, repeat_on_trigger, RepeatOnNotifier, RepeatOnTrigger, RepeatOptions};
pub use scheduler::{RemoteSender, Scheduler, SchedulerConfig};
pub use stream::{Callbacks, Observer, Operator, Stream, Subject, Subscriber, Subscription, SubscriptionId, Termination};
