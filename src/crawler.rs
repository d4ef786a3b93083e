use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};

use crate::spiders::Spider;

/// Counters of a single [`Crawler::run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrawlStats {
    pub requests: usize,
    pub failed: usize,
    pub items: usize,
    pub processed: usize,
}

struct Scraped<R> {
    new_requests: Vec<R>,
    items: usize,
    failed: bool,
}

pub struct Crawler {
    delay: Duration,
    crawling_concurrency: usize,
    processing_concurrency: usize,
}

impl Crawler {
    pub fn new(
        delay: Duration,
        crawling_concurrency: usize,
        processing_concurrency: usize,
    ) -> Self {
        Self {
            delay,
            crawling_concurrency: crawling_concurrency.max(1),
            processing_concurrency: processing_concurrency.max(1),
        }
    }

    /// Crawls from the spider's start requests until nothing is left to scrape
    /// and every item has been processed.
    pub async fn run<S>(&self, spider: Arc<S>) -> CrawlStats
    where
        S: Spider + 'static,
    {
        let mut visited = HashSet::new();
        let mut stats = CrawlStats::default();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (scraped_tx, mut scraped_rx) = mpsc::channel(self.crawling_concurrency);
        let (items_tx, items_rx) = mpsc::channel(self.processing_concurrency);
        let processed = Arc::new(AtomicUsize::new(0));

        let mut pending = 0usize;
        for request in spider.start_requests() {
            if visited.insert(request.clone()) && requests_tx.send(request).is_ok() {
                pending += 1;
            }
        }

        let processors = self.launch_processors(spider.clone(), items_rx, processed.clone());
        let scrapers = self.launch_scrapers(spider.clone(), requests_rx, scraped_tx, items_tx);

        while pending > 0 {
            let Some(scraped) = scraped_rx.recv().await else {
                break;
            };
            pending -= 1;
            stats.requests += 1;
            stats.items += scraped.items;
            if scraped.failed {
                stats.failed += 1;
            }
            for request in scraped.new_requests {
                if visited.insert(request.clone()) {
                    tracing::trace!(?request, "queueing");
                    if requests_tx.send(request).is_ok() {
                        pending += 1;
                    }
                }
            }
        }

        // closing the queue stops the scrapers, which in turn close the item channel
        drop(requests_tx);
        if let Err(err) = scrapers.await {
            tracing::error!("scrapers stopped abnormally: {}", err);
        }
        if let Err(err) = processors.await {
            tracing::error!("processors stopped abnormally: {}", err);
        }

        stats.processed = processed.load(Ordering::SeqCst);
        tracing::debug!(spider = %spider.name(), ?stats, "crawl finished");
        stats
    }

    fn launch_processors<S>(
        &self,
        spider: Arc<S>,
        items: mpsc::Receiver<S::Item>,
        processed: Arc<AtomicUsize>,
    ) -> tokio::task::JoinHandle<()>
    where
        S: Spider + 'static,
    {
        let concurrency = self.processing_concurrency;
        tokio::spawn(async move {
            ReceiverStream::new(items)
                .for_each_concurrent(concurrency, |item| {
                    let spider = &spider;
                    let processed = &processed;
                    async move {
                        match spider.process(item).await {
                            Ok(()) => {
                                processed.fetch_add(1, Ordering::SeqCst);
                            }
                            Err(err) => tracing::error!("failed processing item: {}", err),
                        }
                    }
                })
                .await;
        })
    }

    fn launch_scrapers<S>(
        &self,
        spider: Arc<S>,
        requests: mpsc::UnboundedReceiver<S::Request>,
        scraped_tx: mpsc::Sender<Scraped<S::Request>>,
        items_tx: mpsc::Sender<S::Item>,
    ) -> tokio::task::JoinHandle<()>
    where
        S: Spider + 'static,
    {
        let concurrency = self.crawling_concurrency;
        let delay = self.delay;
        tokio::spawn(async move {
            UnboundedReceiverStream::new(requests)
                .for_each_concurrent(concurrency, |request| {
                    let spider = &spider;
                    let items_tx = &items_tx;
                    let scraped_tx = &scraped_tx;
                    async move {
                        let outcome = match spider.scrape(request.clone()).await {
                            Ok((items, new_requests)) => {
                                let count = items.len();
                                for item in items {
                                    let _ = items_tx.send(item).await;
                                }
                                Scraped {
                                    new_requests,
                                    items: count,
                                    failed: false,
                                }
                            }
                            Err(err) => {
                                tracing::warn!(?request, "scrape failed: {}", err);
                                Scraped {
                                    new_requests: Vec::new(),
                                    items: 0,
                                    failed: true,
                                }
                            }
                        };
                        let _ = scraped_tx.send(outcome).await;

                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                })
                .await;
            drop(items_tx);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Walks the numbers below `limit`, each `n` linking to `2n` and `2n + 1`.
    struct NumberSpider {
        limit: u32,
        fail_on: Option<u32>,
        scraped: Mutex<Vec<u32>>,
        processed: Mutex<Vec<u32>>,
    }

    impl NumberSpider {
        fn new(limit: u32, fail_on: Option<u32>) -> Self {
            Self {
                limit,
                fail_on,
                scraped: Mutex::new(Vec::new()),
                processed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Spider for NumberSpider {
        type Item = u32;
        type Request = u32;

        fn name(&self) -> String {
            String::from("numbers")
        }

        fn start_requests(&self) -> Vec<u32> {
            vec![1, 1]
        }

        async fn scrape(&self, request: u32) -> Result<(Vec<u32>, Vec<u32>), Error> {
            self.scraped.lock().push(request);
            if Some(request) == self.fail_on {
                return Err(Error::Internal(format!("refusing {}", request)));
            }
            // every number also links back to 1 to exercise deduplication
            let next = [2 * request, 2 * request + 1, 1]
                .into_iter()
                .filter(|n| *n < self.limit)
                .collect();
            Ok((vec![request], next))
        }

        async fn process(&self, item: u32) -> Result<(), Error> {
            if item % 5 == 0 {
                return Err(Error::Internal("multiples of five are rejected".into()));
            }
            self.processed.lock().push(item);
            Ok(())
        }
    }

    #[tokio::test]
    async fn every_request_is_scraped_once() {
        let spider = Arc::new(NumberSpider::new(16, None));
        let crawler = Crawler::new(Duration::ZERO, 4, 2);

        let stats = crawler.run(spider.clone()).await;

        let mut scraped = spider.scraped.lock().clone();
        scraped.sort_unstable();
        assert_eq!(scraped, (1..16).collect::<Vec<_>>());
        assert_eq!(stats.requests, 15);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.items, 15);
    }

    #[tokio::test]
    async fn processing_errors_are_not_fatal() {
        let spider = Arc::new(NumberSpider::new(16, None));
        let crawler = Crawler::new(Duration::ZERO, 4, 2);

        let stats = crawler.run(spider.clone()).await;

        // 5, 10 and 15 are rejected
        assert_eq!(stats.processed, 12);
        assert_eq!(spider.processed.lock().len(), 12);
    }

    #[tokio::test]
    async fn failed_requests_do_not_expand() {
        let spider = Arc::new(NumberSpider::new(16, Some(2)));
        let crawler = Crawler::new(Duration::ZERO, 1, 1);

        let stats = crawler.run(spider.clone()).await;

        let mut scraped = spider.scraped.lock().clone();
        scraped.sort_unstable();
        assert_eq!(scraped, vec![1, 2, 3, 6, 7, 12, 13, 14, 15]);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.requests, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_applied_between_requests() {
        let spider = Arc::new(NumberSpider::new(4, None));
        let crawler = Crawler::new(Duration::from_secs(1), 1, 1);

        let started = tokio::time::Instant::now();
        let stats = crawler.run(spider).await;

        assert_eq!(stats.requests, 3);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
