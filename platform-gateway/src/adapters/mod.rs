//! Concrete platform adapters.
//!
//! All five share the OAuth plumbing in [`crate::oauth2`] and the HTTP
//! helpers in [`crate::http`]; what remains per platform is payload shape.

mod facebook;
mod graph;
mod instagram;
mod pinterest;
mod twitter;
mod youtube;

pub use facebook::FacebookAdapter;
pub use instagram::InstagramAdapter;
pub use pinterest::PinterestAdapter;
pub use twitter::TwitterAdapter;
pub use youtube::YouTubeAdapter;

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use socialsync::providers::{AnalyticsPoint, AnalyticsStream};
use socialsync::AdapterError;
use std::future::Future;

/// Flatten page fetches into one lazy stream of points.
///
/// `fetch` receives the current cursor and returns the page's points plus
/// the next cursor, `None` on the last page. Nothing is fetched until the
/// stream is polled.
pub(crate) fn paged<C, F, Fut>(first: C, mut fetch: F) -> AnalyticsStream
where
    C: Send + 'static,
    F: FnMut(C) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(Vec<AnalyticsPoint>, Option<C>), AdapterError>> + Send + 'static,
{
    stream::try_unfold(Some(first), move |cursor: Option<C>| {
        let page = cursor.map(&mut fetch);
        async move {
            match page {
                None => Ok::<_, AdapterError>(None),
                Some(page) => {
                    let (points, next) = page.await?;
                    Ok(Some((points, next)))
                }
            }
        }
    })
    .map_ok(|points| stream::iter(points.into_iter().map(Ok::<_, AdapterError>)))
    .try_flatten()
    .boxed()
}

/// Inclusive (start, end) dates covering the last `days_back` days.
pub(crate) fn date_range(days_back: u32) -> (NaiveDate, NaiveDate) {
    let end = Utc::now().date_naive();
    let start = end - ChronoDuration::days(i64::from(days_back.max(1)) - 1);
    (start, end)
}

/// Text with the link appended, for platforms without a separate link field.
pub(crate) fn text_with_link(text: &str, link: Option<&str>) -> String {
    match link {
        Some(link) if !link.is_empty() && !text.contains(link) => {
            if text.is_empty() {
                link.to_string()
            } else {
                format!("{}\n\n{}", text, link)
            }
        }
        _ => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(metric: &str, value: f64) -> AnalyticsPoint {
        AnalyticsPoint {
            metric: metric.to_string(),
            date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            value,
        }
    }

    #[tokio::test]
    async fn test_paged_walks_every_page() {
        let stream = paged(0u32, |page| async move {
            let next = if page < 2 { Some(page + 1) } else { None };
            Ok((vec![point("views", page as f64)], next))
        });

        let points: Vec<AnalyticsPoint> = stream.try_collect().await.unwrap();
        let values: Vec<f64> = points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_paged_stops_on_error() {
        let stream = paged(0u32, |page| async move {
            if page == 1 {
                return Err(AdapterError::TransientNetwork("reset".into()));
            }
            Ok((vec![point("views", 1.0)], Some(page + 1)))
        });

        let result: Result<Vec<AnalyticsPoint>, AdapterError> = stream.try_collect().await;
        assert!(matches!(result, Err(AdapterError::TransientNetwork(_))));
    }

    #[test]
    fn test_date_range_inclusive() {
        let (start, end) = date_range(7);
        assert_eq!((end - start).num_days(), 6);
        let (start, end) = date_range(0);
        assert_eq!(start, end);
    }

    #[test]
    fn test_text_with_link() {
        assert_eq!(text_with_link("hi", Some("https://x.io")), "hi\n\nhttps://x.io");
        assert_eq!(text_with_link("see https://x.io", Some("https://x.io")), "see https://x.io");
        assert_eq!(text_with_link("hi", None), "hi");
        assert_eq!(text_with_link("", Some("https://x.io")), "https://x.io");
    }
}
