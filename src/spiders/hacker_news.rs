use std::{collections::HashSet, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use scraper::{Html, Selector};
use url::Url;

use crate::{
    error::Error,
    fetcher::{Fetcher, Page},
    storage::{PageStore, SavedPage},
};

const STORY_ROWS: &str = "tr.athing";
const STORY_LINK: &str = "span.titleline > a, a.storylink";
const COMMENT_LINKS: &str = ".commtext.c00 a[href]";

/// An entry of the front page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Story {
    pub id: String,
    pub url: Url,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Request {
    FrontPage,
    Story(Story),
    Comments(Story),
    Linked { story: Story, url: Url },
}

/// Mirrors the front page stories and every page linked from their comments.
pub struct HackerNewsSpider {
    fetcher: Arc<Fetcher>,
    store: PageStore,
    base_url: Url,
    /// Stories of the latest front page whose page was downloaded.
    known_stories: Mutex<HashSet<Url>>,
}

impl HackerNewsSpider {
    pub fn new(fetcher: Arc<Fetcher>, store: PageStore, base_url: &str) -> Result<Self, Error> {
        let base_url = Url::parse(base_url).map_err(|_| Error::InvalidUrl(base_url.into()))?;
        Ok(Self {
            fetcher,
            store,
            base_url,
            known_stories: Mutex::new(HashSet::new()),
        })
    }

    /// Keeps the stories not downloaded yet, forgetting the known stories
    /// that left the front page.
    fn new_stories(&self, stories: Vec<Story>) -> Vec<Story> {
        let mut known = self.known_stories.lock();
        known.retain(|url| stories.iter().any(|story| &story.url == url));
        stories
            .into_iter()
            .filter(|story| {
                let new = !known.contains(&story.url);
                if !new {
                    tracing::trace!(url = %story.url, "story already downloaded");
                }
                new
            })
            .collect()
    }

    fn comments_url(&self, story: &Story) -> Result<Url, Error> {
        let path = format!("item?id={}", story.id);
        self.base_url
            .join(&path)
            .map_err(|_| Error::InvalidUrl(path))
    }

    fn saved_page(story: &Story, page: Page) -> SavedPage {
        SavedPage {
            folder: story.url.to_string(),
            file_name: page.url.clone(),
            page,
        }
    }
}

impl Debug for HackerNewsSpider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HackerNewsSpider {{ base_url: {} }}", self.base_url)
    }
}

#[async_trait]
impl super::Spider for HackerNewsSpider {
    type Item = SavedPage;
    type Request = Request;

    fn name(&self) -> String {
        String::from("hacker_news")
    }

    fn start_requests(&self) -> Vec<Request> {
        vec![Request::FrontPage]
    }

    #[tracing::instrument(skip(self))]
    async fn scrape(&self, request: Request) -> Result<(Vec<SavedPage>, Vec<Request>), Error> {
        match request {
            Request::FrontPage => {
                let page = self
                    .fetcher
                    .fetch(self.base_url.as_str())
                    .await
                    .map_err(|err| {
                        tracing::error!("{}", err);
                        Error::FrontPageUnavailable
                    })?;
                let stories = parse_front_page(&page.html(), &self.base_url)?;
                tracing::debug!("{} stories on the front page", stories.len());

                let mut new_requests = Vec::new();
                for story in self.new_stories(stories) {
                    tracing::trace!(id = %story.id, title = %story.title, "new story");
                    new_requests.push(Request::Story(story.clone()));
                    new_requests.push(Request::Comments(story));
                }
                Ok((Vec::new(), new_requests))
            }
            Request::Story(story) => {
                let page = self.fetcher.fetch(story.url.as_str()).await?;
                self.known_stories.lock().insert(story.url.clone());
                Ok((vec![Self::saved_page(&story, page)], Vec::new()))
            }
            Request::Comments(story) => {
                let comments_url = self.comments_url(&story)?;
                let page = self.fetcher.fetch(comments_url.as_str()).await?;
                let links = parse_comment_links(&page.html(), &comments_url)?;
                tracing::debug!(story = %story.url, "{} links in comments", links.len());
                let new_requests = links
                    .into_iter()
                    .map(|url| Request::Linked {
                        story: story.clone(),
                        url,
                    })
                    .collect();
                Ok((Vec::new(), new_requests))
            }
            Request::Linked { story, url } => {
                let page = self.fetcher.fetch(url.as_str()).await?;
                Ok((vec![Self::saved_page(&story, page)], Vec::new()))
            }
        }
    }

    #[tracing::instrument(skip(self, item), fields(file = %item.file_name))]
    async fn process(&self, item: SavedPage) -> Result<(), Error> {
        match self.store.save(&item).await? {
            Some(path) => tracing::debug!("saved '{}'", path.display()),
            None => tracing::trace!("already on disk"),
        }
        Ok(())
    }
}

fn selector(css: &str) -> Result<Selector, Error> {
    Selector::parse(css).map_err(|err| Error::Internal(format!("selector '{}': {}", css, err)))
}

/// Extracts the stories of a front page, resolving relative links against `base_url`.
pub fn parse_front_page(html: &str, base_url: &Url) -> Result<Vec<Story>, Error> {
    let rows = selector(STORY_ROWS)?;
    let link = selector(STORY_LINK)?;
    let document = Html::parse_document(html);

    let mut stories = Vec::new();
    for row in document.select(&rows) {
        let Some(id) = row.value().attr("id") else {
            continue;
        };
        let Some(anchor) = row.select(&link).next() else {
            tracing::trace!(id, "story without link");
            continue;
        };
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        match base_url.join(href.trim()) {
            Ok(url) => stories.push(Story {
                id: id.to_string(),
                url,
                title: anchor.text().collect::<String>().trim().to_string(),
            }),
            Err(err) => tracing::warn!(id, href, "skipping story: {}", err),
        }
    }
    Ok(stories)
}

/// Extracts the distinct http(s) links written in top-level-colour comments.
pub fn parse_comment_links(html: &str, page_url: &Url) -> Result<Vec<Url>, Error> {
    let links = selector(COMMENT_LINKS)?;
    let document = Html::parse_document(html);

    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for anchor in document.select(&links) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Ok(url) = page_url.join(href.trim()) else {
            tracing::trace!(href, "unparsable link");
            continue;
        };
        if !matches!(url.scheme(), "http" | "https") {
            continue;
        }
        if seen.insert(url.clone()) {
            urls.push(url);
        }
    }
    Ok(urls)
}
