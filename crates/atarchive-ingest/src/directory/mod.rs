//! Identity discovery from the public directory log.
//!
//! - [`crawler`] - paginated, resumable export of directory operations
//! - [`resolver`] - per-identifier endpoint history built from those operations

pub mod crawler;
pub mod resolver;

pub use crawler::{Crawl, CrawlPage, CrawlerConfig, DirectoryCrawler};
pub use resolver::{ApplyStats, EndpointInterval, IdentityRecord, IdentityResolver};
