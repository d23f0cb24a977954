//! Original-image URL parsing: the `(illust_id, page_index, ext)` triple is
//! encoded in the pximg filename (`{illust_id}_p{page}.{ext}`).

pub const ALLOWED_IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

const ALLOWED_HOSTS: &[&str] = &["i.pximg.net", "i.pixiv.cat", "i.pixiv.re", "i.pixiv.nl"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PixivUrlError {
    #[error("not an http(s) url")]
    NotHttp,
    #[error("unsupported host")]
    UnsupportedHost,
    #[error("filename does not match {{illust_id}}_p{{page}}.{{ext}}")]
    BadFilename,
    #[error("unsupported image extension")]
    UnsupportedExt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPixivUrl {
    pub illust_id: i64,
    pub page_index: i64,
    pub ext: String,
}

/// Parse a pximg (or mirror) original-image URL.
pub fn parse_pixiv_original_url(url: &str) -> Result<ParsedPixivUrl, PixivUrlError> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or(PixivUrlError::NotHttp)?;

    let (host, path) = rest.split_once('/').ok_or(PixivUrlError::BadFilename)?;
    let host = host.to_ascii_lowercase();
    if !ALLOWED_HOSTS.contains(&host.as_str()) {
        return Err(PixivUrlError::UnsupportedHost);
    }

    let filename = path
        .rsplit('/')
        .next()
        .ok_or(PixivUrlError::BadFilename)?
        .split('?')
        .next()
        .unwrap_or_default();

    let (stem, ext) = filename.rsplit_once('.').ok_or(PixivUrlError::BadFilename)?;
    let ext = ext.to_ascii_lowercase();
    if !ALLOWED_IMAGE_EXTS.contains(&ext.as_str()) {
        return Err(PixivUrlError::UnsupportedExt);
    }

    let (illust_part, page_part) = stem.rsplit_once("_p").ok_or(PixivUrlError::BadFilename)?;
    let illust_id: i64 = illust_part.parse().map_err(|_| PixivUrlError::BadFilename)?;
    let page_index: i64 = page_part.parse().map_err(|_| PixivUrlError::BadFilename)?;
    if illust_id <= 0 || page_index < 0 {
        return Err(PixivUrlError::BadFilename);
    }

    Ok(ParsedPixivUrl {
        illust_id,
        page_index,
        ext,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_original_url() {
        let parsed = parse_pixiv_original_url(
            "https://i.pximg.net/img-original/img/2020/01/01/00/00/00/12345_p3.png",
        )
        .unwrap();
        assert_eq!(parsed.illust_id, 12345);
        assert_eq!(parsed.page_index, 3);
        assert_eq!(parsed.ext, "png");
    }

    #[test]
    fn accepts_mirror_hosts() {
        let parsed = parse_pixiv_original_url(
            "https://i.pixiv.cat/img-original/img/2020/01/01/00/00/00/7_p0.jpg",
        )
        .unwrap();
        assert_eq!(parsed.illust_id, 7);
    }

    #[test]
    fn rejects_foreign_hosts_and_garbage() {
        assert_eq!(
            parse_pixiv_original_url("https://example.com/1_p0.jpg").unwrap_err(),
            PixivUrlError::UnsupportedHost
        );
        assert_eq!(
            parse_pixiv_original_url("ftp://i.pximg.net/1_p0.jpg").unwrap_err(),
            PixivUrlError::NotHttp
        );
        assert_eq!(
            parse_pixiv_original_url("https://i.pximg.net/a/evil.jpg").unwrap_err(),
            PixivUrlError::BadFilename
        );
        assert_eq!(
            parse_pixiv_original_url("https://i.pximg.net/a/1_p0.tiff").unwrap_err(),
            PixivUrlError::UnsupportedExt
        );
    }
}
