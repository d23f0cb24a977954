//! Illust-detail payload parsing.
//!
//! The upstream document is loosely typed (numbers arrive as strings, field
//! names vary between API revisions), so parsing goes through `serde_json::Value`
//! with tolerant coercions. Shape violations that can never self-heal are
//! [`IllustParseError`]s; callers map them to permanent job failures.

use serde_json::Value;

use crate::urls::parse_pixiv_original_url;

pub const MAX_TAGS: usize = 200;
pub const MAX_PAGE_COUNT: i64 = 1000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IllustParseError {
    #[error("detail document missing illust object")]
    MissingIllust,
    #[error("invalid page_count")]
    InvalidPageCount,
    #[error("missing original image urls")]
    MissingOriginalUrls,
    #[error("invalid original url")]
    InvalidOriginalUrl,
}

/// One page of an illust with its storage-relevant fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllustPage {
    pub page_index: i64,
    pub original_url: String,
    pub ext: String,
}

/// Everything hydration persists for one illust.
#[derive(Debug, Clone, Default)]
pub struct ParsedIllust {
    pub illust_id: i64,
    pub pages: Vec<IllustPage>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub aspect_ratio: Option<f64>,
    pub orientation: Option<i64>,
    pub x_restrict: Option<i64>,
    pub ai_type: Option<i64>,
    pub illust_type: Option<i64>,
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
    pub title: Option<String>,
    pub created_at_pixiv: Option<String>,
    pub bookmark_count: Option<i64>,
    pub view_count: Option<i64>,
    pub comment_count: Option<i64>,
    /// `(name, translated_name)`, deduped by name, capped at [`MAX_TAGS`].
    pub tags: Vec<(String, Option<String>)>,
}

fn as_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_str(value: Option<&Value>) -> Option<String> {
    let s = value?.as_str()?.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Portrait when taller than wide, landscape when wider, square otherwise.
fn derive_orientation(width: Option<i64>, height: Option<i64>) -> (Option<f64>, Option<i64>) {
    match (width, height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => {
            let orientation = if w > h {
                2
            } else if h > w {
                1
            } else {
                3
            };
            (Some(w as f64 / h as f64), Some(orientation))
        }
        _ => (None, None),
    }
}

fn extract_tags(illust: &Value) -> Vec<(String, Option<String>)> {
    let Some(raw_tags) = illust.get("tags").and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for raw in raw_tags.iter().take(MAX_TAGS * 2) {
        let Some(name) = as_str(raw.get("name")) else {
            continue;
        };
        if !seen.insert(name.clone()) {
            continue;
        }
        let translated = as_str(raw.get("translated_name"));
        out.push((name, translated));
        if out.len() >= MAX_TAGS {
            break;
        }
    }
    out
}

fn extract_original_urls(illust: &Value, page_count: i64) -> Result<Vec<String>, IllustParseError> {
    if page_count <= 1 {
        if let Some(url) = as_str(
            illust
                .get("meta_single_page")
                .and_then(|m| m.get("original_image_url")),
        ) {
            return Ok(vec![url]);
        }
        // Some single-page documents only fill meta_pages[0].
        if let Some(url) = illust
            .get("meta_pages")
            .and_then(Value::as_array)
            .and_then(|pages| pages.first())
            .and_then(|page| page.get("image_urls"))
            .and_then(|urls| as_str(urls.get("original")))
        {
            return Ok(vec![url]);
        }
        return Err(IllustParseError::MissingOriginalUrls);
    }

    let pages = illust
        .get("meta_pages")
        .and_then(Value::as_array)
        .filter(|pages| !pages.is_empty())
        .ok_or(IllustParseError::MissingOriginalUrls)?;

    let mut urls = Vec::with_capacity(page_count as usize);
    for idx in 0..page_count as usize {
        let url = pages
            .get(idx)
            .and_then(|page| page.get("image_urls"))
            .and_then(|image_urls| as_str(image_urls.get("original")))
            .ok_or(IllustParseError::MissingOriginalUrls)?;
        urls.push(url);
    }
    Ok(urls)
}

/// Parse a full detail document (`{"illust": {...}}`).
pub fn parse_illust_detail(document: &Value) -> Result<ParsedIllust, IllustParseError> {
    let illust = document
        .get("illust")
        .filter(|v| v.is_object())
        .ok_or(IllustParseError::MissingIllust)?;

    let illust_id = as_int(illust.get("id")).ok_or(IllustParseError::MissingIllust)?;

    let page_count = as_int(illust.get("page_count")).unwrap_or(1);
    if page_count <= 0 || page_count > MAX_PAGE_COUNT {
        return Err(IllustParseError::InvalidPageCount);
    }

    let urls = extract_original_urls(illust, page_count)?;
    let mut pages = Vec::with_capacity(urls.len());
    for (idx, url) in urls.into_iter().enumerate() {
        let parsed =
            parse_pixiv_original_url(&url).map_err(|_| IllustParseError::InvalidOriginalUrl)?;
        pages.push(IllustPage {
            page_index: idx as i64,
            original_url: url,
            ext: parsed.ext,
        });
    }

    let width = as_int(illust.get("width"));
    let height = as_int(illust.get("height"));
    let (aspect_ratio, orientation) = derive_orientation(width, height);

    let ai_type = as_int(illust.get("illust_ai_type")).or_else(|| as_int(illust.get("ai_type")));

    let illust_type = as_int(illust.get("illust_type"))
        .or_else(|| match as_str(illust.get("type")).as_deref() {
            Some("illust") => Some(0),
            Some("manga") => Some(1),
            Some("ugoira") => Some(2),
            _ => None,
        })
        .filter(|t| (0..=2).contains(t));

    let user = illust.get("user");
    let user_id = as_int(user.and_then(|u| u.get("id")));
    let user_name = as_str(user.and_then(|u| u.get("name")));

    let created_at_pixiv = as_str(illust.get("create_date"))
        .and_then(|raw| pxr_normalize_created(&raw));

    Ok(ParsedIllust {
        illust_id,
        pages,
        width,
        height,
        aspect_ratio,
        orientation,
        x_restrict: as_int(illust.get("x_restrict")),
        ai_type,
        illust_type,
        user_id,
        user_name,
        title: as_str(illust.get("title")),
        created_at_pixiv,
        bookmark_count: as_int(illust.get("total_bookmarks"))
            .or_else(|| as_int(illust.get("bookmark_count"))),
        view_count: as_int(illust.get("total_view")).or_else(|| as_int(illust.get("view_count"))),
        comment_count: as_int(illust.get("total_comments"))
            .or_else(|| as_int(illust.get("comment_count"))),
        tags: extract_tags(illust),
    })
}

/// `create_date` normalized to whole-second UTC (`Y-M-DTH:M:SZ`).
fn pxr_normalize_created(raw: &str) -> Option<String> {
    let dt = chrono::DateTime::parse_from_rfc3339(raw.trim()).ok()?;
    Some(
        dt.with_timezone(&chrono::Utc)
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn single_page_doc() -> Value {
        json!({
            "illust": {
                "id": 111,
                "page_count": 1,
                "meta_single_page": {
                    "original_image_url":
                        "https://i.pximg.net/img-original/img/2020/01/01/00/00/00/111_p0.jpg"
                },
                "width": 1200,
                "height": 800,
                "x_restrict": 0,
                "illust_ai_type": 1,
                "illust_type": 0,
                "user": {"id": 999, "name": "u"},
                "title": "t",
                "create_date": "2020-01-01T00:00:00+00:00",
                "total_bookmarks": 5,
                "total_view": 50,
                "total_comments": 1,
                "tags": [
                    {"name": "tag1", "translated_name": "t1"},
                    {"name": "tag2"},
                    {"name": "tag1"}
                ]
            }
        })
    }

    #[test]
    fn parses_single_page_document() {
        let parsed = parse_illust_detail(&single_page_doc()).unwrap();
        assert_eq!(parsed.illust_id, 111);
        assert_eq!(parsed.pages.len(), 1);
        assert_eq!(parsed.pages[0].ext, "jpg");
        assert_eq!(parsed.width, Some(1200));
        assert_eq!(parsed.orientation, Some(2), "1200x800 is landscape");
        assert!((parsed.aspect_ratio.unwrap() - 1.5).abs() < 1e-9);
        assert_eq!(parsed.ai_type, Some(1));
        assert_eq!(parsed.user_id, Some(999));
        assert_eq!(parsed.created_at_pixiv.as_deref(), Some("2020-01-01T00:00:00Z"));
        assert_eq!(parsed.bookmark_count, Some(5));
        // Duplicate tag name deduped.
        assert_eq!(
            parsed.tags,
            vec![
                ("tag1".to_string(), Some("t1".to_string())),
                ("tag2".to_string(), None)
            ]
        );
    }

    #[test]
    fn parses_multi_page_document() {
        let doc = json!({
            "illust": {
                "id": 5,
                "page_count": 2,
                "type": "manga",
                "meta_pages": [
                    {"image_urls": {"original":
                        "https://i.pximg.net/img-original/img/2020/01/01/00/00/00/5_p0.png"}},
                    {"image_urls": {"original":
                        "https://i.pximg.net/img-original/img/2020/01/01/00/00/00/5_p1.png"}}
                ],
                "width": 700,
                "height": 700
            }
        });
        let parsed = parse_illust_detail(&doc).unwrap();
        assert_eq!(parsed.pages.len(), 2);
        assert_eq!(parsed.pages[1].page_index, 1);
        assert_eq!(parsed.illust_type, Some(1), "string type maps to manga");
        assert_eq!(parsed.orientation, Some(3), "equal sides is square");
    }

    #[test]
    fn shape_violations_are_permanent() {
        assert_eq!(
            parse_illust_detail(&json!({})).unwrap_err(),
            IllustParseError::MissingIllust
        );
        assert_eq!(
            parse_illust_detail(&json!({"illust": {"id": 1, "page_count": 2000}})).unwrap_err(),
            IllustParseError::InvalidPageCount
        );
        assert_eq!(
            parse_illust_detail(&json!({"illust": {"id": 1, "page_count": 1}})).unwrap_err(),
            IllustParseError::MissingOriginalUrls
        );
    }

    #[test]
    fn numbers_coerce_from_strings() {
        let doc = json!({
            "illust": {
                "id": "42",
                "page_count": "1",
                "meta_single_page": {"original_image_url":
                    "https://i.pximg.net/img-original/img/2020/01/01/00/00/00/42_p0.jpg"},
                "total_bookmarks": "12"
            }
        });
        let parsed = parse_illust_detail(&doc).unwrap();
        assert_eq!(parsed.illust_id, 42);
        assert_eq!(parsed.bookmark_count, Some(12));
    }
}
