//! Demonstration site served by `rendercache serve`.
//!
//! One route per strategy:
//!
//! | route            | strategy                       |
//! |------------------|--------------------------------|
//! | `/`              | fresh                          |
//! | `/about`         | cache-once                     |
//! | `/posts/{slug}`  | cache-with-revalidation (30s)  |
//! | `/dashboard`     | static-shell (greeting, feed)  |

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use askama::Template;
use bytes::Bytes;

use crate::cache::{
    EngineError, RenderEngine, RenderError, RenderMode, RenderProps, StrategyOverride, page_fn,
    slot_fn, slot_marker,
};

pub const GREETING_SLOT: &str = "greeting";
pub const FEED_SLOT: &str = "feed";
const POST_REVALIDATE_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct Post {
    pub slug: &'static str,
    pub title: &'static str,
    pub body: &'static str,
}

const POSTS: &[Post] = &[
    Post {
        slug: "hello-world",
        title: "Hello, world",
        body: "The first post on a site whose pages are cached per route.",
    },
    Post {
        slug: "stale-while-revalidate",
        title: "Serving stale while revalidating",
        body: "Readers get the cached copy immediately while a fresh one renders in the background.",
    },
    Post {
        slug: "static-shells",
        title: "Static shells with dynamic slots",
        body: "The page frame is cached once; personalised fragments are streamed into it per request.",
    },
];

#[derive(Template)]
#[template(path = "site/home.html")]
struct HomeTemplate<'a> {
    strategy: &'a str,
    render_id: u64,
    posts: &'a [Post],
}

#[derive(Template)]
#[template(path = "site/about.html")]
struct AboutTemplate<'a> {
    strategy: &'a str,
    render_id: u64,
}

#[derive(Template)]
#[template(path = "site/post.html")]
struct PostTemplate<'a> {
    strategy: &'a str,
    render_id: u64,
    title: &'a str,
    body: &'a str,
}

#[derive(Template)]
#[template(path = "site/dashboard.html")]
struct DashboardTemplate<'a> {
    strategy: &'a str,
    render_id: u64,
    greeting: &'a str,
    feed: &'a str,
}

#[derive(Template)]
#[template(path = "site/greeting.html")]
struct GreetingTemplate<'a> {
    name: &'a str,
}

#[derive(Template)]
#[template(path = "site/feed.html")]
struct FeedTemplate<'a> {
    posts: &'a [Post],
    seen: u64,
}

/// Render counters shared by the demo renderers.
#[derive(Debug, Default)]
pub struct DemoSite {
    renders: AtomicU64,
    feed_renders: AtomicU64,
}

impl DemoSite {
    fn next_render(&self) -> u64 {
        self.renders.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn home(&self) -> Result<Bytes, RenderError> {
        render(&HomeTemplate {
            strategy: "fresh",
            render_id: self.next_render(),
            posts: POSTS,
        })
    }

    fn about(&self) -> Result<Bytes, RenderError> {
        render(&AboutTemplate {
            strategy: "cache-once",
            render_id: self.next_render(),
        })
    }

    fn post(&self, props: &RenderProps) -> Result<Bytes, RenderError> {
        let slug = props.param("slug").unwrap_or_default();
        let post = POSTS
            .iter()
            .find(|post| post.slug == slug)
            .ok_or_else(|| RenderError::failed(format!("no post with slug `{slug}`")))?;

        render(&PostTemplate {
            strategy: "cache-with-revalidation",
            render_id: self.next_render(),
            title: post.title,
            body: post.body,
        })
    }

    fn dashboard(&self, props: &RenderProps, mode: RenderMode) -> Result<Bytes, RenderError> {
        let (greeting, feed) = match mode {
            RenderMode::ShellBuild => (slot_marker(GREETING_SLOT), slot_marker(FEED_SLOT)),
            RenderMode::Normal => (utf8(greeting(props)?)?, utf8(self.feed()?)?),
        };

        render(&DashboardTemplate {
            strategy: "static-shell",
            render_id: self.next_render(),
            greeting: &greeting,
            feed: &feed,
        })
    }

    fn feed(&self) -> Result<Bytes, RenderError> {
        render(&FeedTemplate {
            posts: POSTS,
            seen: self.feed_renders.fetch_add(1, Ordering::Relaxed) + 1,
        })
    }
}

fn greeting(props: &RenderProps) -> Result<Bytes, RenderError> {
    let name = props
        .query("name")
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or("guest");
    render(&GreetingTemplate { name })
}

fn render<T: Template>(template: &T) -> Result<Bytes, RenderError> {
    template
        .render()
        .map(Bytes::from)
        .map_err(|err| RenderError::failed(format!("template rendering failed: {err}")))
}

fn utf8(bytes: Bytes) -> Result<String, RenderError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|err| RenderError::failed(format!("fragment is not utf-8: {err}")))
}

/// Register every demo route and slot on `engine`.
pub fn register(engine: &RenderEngine) -> Result<Arc<DemoSite>, EngineError> {
    let site = Arc::new(DemoSite::default());

    let home = Arc::clone(&site);
    engine.register_route(
        "/",
        page_fn(move |_props, _mode| {
            let site = Arc::clone(&home);
            async move { site.home() }
        }),
        StrategyOverride::fresh(),
    )?;

    let about = Arc::clone(&site);
    engine.register_route(
        "/about",
        page_fn(move |_props, _mode| {
            let site = Arc::clone(&about);
            async move { site.about() }
        }),
        StrategyOverride::cache_once(),
    )?;

    let posts = Arc::clone(&site);
    engine.register_route(
        "/posts/{slug}",
        page_fn(move |props: RenderProps, _mode| {
            let site = Arc::clone(&posts);
            async move { site.post(&props) }
        }),
        StrategyOverride::revalidate_after(POST_REVALIDATE_AFTER),
    )?;

    let dashboard = Arc::clone(&site);
    engine.register_route(
        "/dashboard",
        page_fn(move |props: RenderProps, mode| {
            let site = Arc::clone(&dashboard);
            async move { site.dashboard(&props, mode) }
        }),
        StrategyOverride::static_shell([GREETING_SLOT, FEED_SLOT]),
    )?;

    engine.register_slot(
        "/dashboard",
        GREETING_SLOT,
        slot_fn(|props: RenderProps| async move { greeting(&props) }),
    )?;

    let feed = Arc::clone(&site);
    engine.register_slot(
        "/dashboard",
        FEED_SLOT,
        slot_fn(move |_props| {
            let site = Arc::clone(&feed);
            async move { site.feed() }
        }),
    )?;

    Ok(site)
}
