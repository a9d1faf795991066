//! Fragment rendering.
//!
//! Turns cached provider data into a small HTML list plus the hash of the
//! data it was rendered from. Every path yields a string: a miss renders a
//! "no data" placeholder.

use crate::cache::{CacheScope, Cached, GetOptions, Source};
use crate::change::{VOLATILE_KEYS, content_hash};
use crate::provider::lastfm::{self, LastfmClient};
use crate::provider::trakt::TraktClient;
use crate::service::Service;
use askama::Template;
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use tracing::error;

pub const LIST_LIMIT: u32 = 10;
pub const TOP_ARTISTS_PERIOD: &str = "7day";

/// Fragments the server knows how to render.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContentId {
    LastfmRecent,
    LastfmNowPlaying,
    LastfmTopArtists,
    TraktHistory,
    TraktWatching,
}

impl ContentId {
    pub const ALL: [ContentId; 5] = [
        ContentId::LastfmRecent,
        ContentId::LastfmNowPlaying,
        ContentId::LastfmTopArtists,
        ContentId::TraktHistory,
        ContentId::TraktWatching,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentId::LastfmRecent => "lastfm-recent",
            ContentId::LastfmNowPlaying => "lastfm-now-playing",
            ContentId::LastfmTopArtists => "lastfm-top-artists",
            ContentId::TraktHistory => "trakt-history",
            ContentId::TraktWatching => "trakt-watching",
        }
    }

    pub fn service(&self) -> Service {
        match self {
            ContentId::LastfmRecent | ContentId::LastfmNowPlaying | ContentId::LastfmTopArtists => {
                Service::Lastfm
            }
            ContentId::TraktHistory | ContentId::TraktWatching => Service::Trakt,
        }
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| format!("unknown content id '{}'", s))
    }
}

/// Rendered fragment and what it was rendered from.
#[derive(Debug, Clone, Serialize)]
pub struct Rendered {
    pub html: String,
    pub hash: String,
    pub source: Source,
    /// Something is playing right now
    pub live: bool,
}

/// One row of a rendered list; also the hashed payload.
#[derive(Debug, Clone, Serialize)]
struct Item {
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    subtitle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    now_playing: bool,
}

/// Row as the list template sees it.
struct Row<'a> {
    title: &'a str,
    href: Option<&'a str>,
    subtitle: Option<&'a str>,
    now_playing: bool,
}

impl<'a> From<&'a Item> for Row<'a> {
    fn from(item: &'a Item) -> Self {
        Self {
            title: &item.title,
            href: item.url.as_deref().filter(|u| !u.is_empty()),
            subtitle: item.subtitle.as_deref(),
            now_playing: item.now_playing,
        }
    }
}

#[derive(Template)]
#[template(path = "fragment_list.html")]
struct ListTemplate<'a> {
    content: ContentId,
    rows: Vec<Row<'a>>,
}

/// "No data" placeholder
#[derive(Template)]
#[template(path = "fragment_empty.html")]
struct EmptyTemplate;

fn render_list(content: ContentId, items: &[Item]) -> String {
    let rendered = if items.is_empty() {
        EmptyTemplate.render()
    } else {
        ListTemplate {
            content,
            rows: items.iter().map(Row::from).collect(),
        }
        .render()
    };
    rendered.unwrap_or_else(|err| {
        error!("Template rendering failed for {}: {}", content, err);
        EmptyTemplate.render().unwrap_or_default()
    })
}

fn finish(content: ContentId, items: Vec<Item>, source: Source, live: bool) -> Rendered {
    let html = render_list(content, &items);
    let payload = json!({ "content": content.as_str(), "live": live, "items": items });
    Rendered {
        html,
        hash: content_hash(&payload, &VOLATILE_KEYS),
        source,
        live,
    }
}

fn list_of<T>(cached: Cached<Vec<T>>, to_item: impl Fn(T) -> Item) -> (Vec<Item>, Source) {
    let items = cached
        .value
        .unwrap_or_default()
        .into_iter()
        .map(to_item)
        .collect();
    (items, cached.source)
}

fn track_item(track: lastfm::Track) -> Item {
    Item {
        now_playing: track.is_now_playing(),
        subtitle: Some(track.artist.text).filter(|a| !a.is_empty()),
        url: Some(track.url).filter(|u| !u.is_empty()),
        title: track.name,
    }
}

#[derive(Clone)]
pub struct Renderer {
    lastfm: LastfmClient,
    trakt: TraktClient,
}

impl Renderer {
    pub fn new(lastfm: LastfmClient, trakt: TraktClient) -> Self {
        Self { lastfm, trakt }
    }

    pub fn lastfm(&self) -> &LastfmClient {
        &self.lastfm
    }

    pub fn trakt(&self) -> &TraktClient {
        &self.trakt
    }

    /// Render `content` through `scope`. Fragments backed by the same
    /// request share one lookup per scope.
    pub async fn render(
        &self,
        scope: &CacheScope,
        content: ContentId,
        options: GetOptions,
    ) -> Rendered {
        match content {
            ContentId::LastfmRecent => {
                let cached = self.lastfm.recent_tracks(scope, LIST_LIMIT, options).await;
                let live = cached
                    .value
                    .as_deref()
                    .and_then(lastfm::now_playing)
                    .is_some();
                let (items, source) = list_of(cached, track_item);
                finish(content, items, source, live)
            }
            ContentId::LastfmNowPlaying => {
                let cached = self.lastfm.recent_tracks(scope, LIST_LIMIT, options).await;
                let playing = cached
                    .value
                    .as_deref()
                    .and_then(lastfm::now_playing)
                    .cloned();
                let live = playing.is_some();
                let items = playing.into_iter().map(track_item).collect();
                finish(content, items, cached.source, live)
            }
            ContentId::LastfmTopArtists => {
                let cached = self
                    .lastfm
                    .top_artists(scope, TOP_ARTISTS_PERIOD, LIST_LIMIT, options)
                    .await;
                let (items, source) = list_of(cached, |artist| Item {
                    subtitle: Some(format!("{} plays", artist.playcount))
                        .filter(|_| !artist.playcount.is_empty()),
                    url: Some(artist.url).filter(|u| !u.is_empty()),
                    title: artist.name,
                    now_playing: false,
                });
                finish(content, items, source, false)
            }
            ContentId::TraktHistory => {
                let cached = self.trakt.history(scope, LIST_LIMIT, options).await;
                let (items, source) = list_of(cached, |entry| Item {
                    title: entry.media.display_title(),
                    subtitle: Some(entry.watched_at),
                    url: None,
                    now_playing: false,
                });
                finish(content, items, source, false)
            }
            ContentId::TraktWatching => {
                let cached = self.trakt.watching(scope, options).await;
                let live = cached.value.is_some();
                let items = cached
                    .value
                    .into_iter()
                    .map(|watching| Item {
                        title: watching.media.display_title(),
                        subtitle: watching.action,
                        url: None,
                        now_playing: true,
                    })
                    .collect();
                finish(content, items, cached.source, live)
            }
        }
    }
}
