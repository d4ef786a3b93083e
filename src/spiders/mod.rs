use std::{fmt::Debug, hash::Hash};

use async_trait::async_trait;

use crate::error::Error;

pub mod hacker_news;

#[async_trait]
pub trait Spider: Send + Sync {
    type Item: Send + 'static;
    /// Unit of work handed to [`Spider::scrape`]; equal requests are scraped once per run.
    type Request: Clone + Debug + Eq + Hash + Send + Sync + 'static;

    fn name(&self) -> String;
    fn start_requests(&self) -> Vec<Self::Request>;
    async fn scrape(
        &self,
        request: Self::Request,
    ) -> Result<(Vec<Self::Item>, Vec<Self::Request>), Error>;
    async fn process(&self, item: Self::Item) -> Result<(), Error>;
}
