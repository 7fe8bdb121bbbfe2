//! XMLTV document types and conversion into normalized records.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime};
use epgcache_store::{ImportError, ProgramRecord, RecordStream};
use regex::Regex;
use serde::Deserialize;

/// XMLTV timestamp with numeric offset, e.g. `20240101093000 +0900`.
const TIME_FORMAT_WITH_OFFSET: &str = "%Y%m%d%H%M%S %z";

/// XMLTV timestamp without offset; read as UTC.
const TIME_FORMAT_UTC: &str = "%Y%m%d%H%M%S";

/// Leading number of a rating value (`PG-13` -> 13, `12` -> 12).
#[allow(clippy::expect_used)]
static RATING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)").expect("failed to compile rating regex"));

/// `<tv>` root element.
#[derive(Debug, Deserialize)]
#[serde(rename = "tv")]
pub struct TvDocument {
    /// Every `<programme>` in document order.
    #[serde(rename = "programme", default)]
    pub programmes: Vec<XmlProgramme>,
}

/// Text element with an optional `lang` attribute.
#[derive(Debug, Clone, Deserialize)]
pub struct LangText {
    /// Language code.
    #[serde(rename = "@lang", default)]
    pub lang: Option<String>,
    /// Element text.
    #[serde(rename = "$text", default)]
    pub text: String,
}

/// `<rating>` element.
#[derive(Debug, Clone, Deserialize)]
pub struct XmlRating {
    /// Rating system (e.g. `MPAA`).
    #[serde(rename = "@system", default)]
    pub system: Option<String>,
    /// Rating value (e.g. `PG-13`).
    #[serde(default)]
    pub value: Option<String>,
}

/// `<icon>` element.
#[derive(Debug, Clone, Deserialize)]
pub struct XmlIcon {
    /// Image location.
    #[serde(rename = "@src")]
    pub src: String,
}

/// `<programme>` element.
#[derive(Debug, Clone, Deserialize)]
pub struct XmlProgramme {
    /// Start timestamp.
    #[serde(rename = "@start")]
    pub start: String,
    /// Stop timestamp (optional in XMLTV).
    #[serde(rename = "@stop", default)]
    pub stop: Option<String>,
    /// Channel id.
    #[serde(rename = "@channel")]
    pub channel: String,
    /// Titles, first one wins.
    #[serde(rename = "title", default)]
    pub titles: Vec<LangText>,
    /// Descriptions, first one wins.
    #[serde(rename = "desc", default)]
    pub descriptions: Vec<LangText>,
    /// Categories; the first numeric one becomes `categoryId`.
    #[serde(rename = "category", default)]
    pub categories: Vec<LangText>,
    /// Ratings, first one wins.
    #[serde(rename = "rating", default)]
    pub ratings: Vec<XmlRating>,
    /// Icon.
    #[serde(default)]
    pub icon: Option<XmlIcon>,
}

impl XmlProgramme {
    /// Converts into a normalized record.
    ///
    /// A programme without `stop` gets `end == start`, so the importer skips
    /// it as invalid instead of guessing a duration.
    ///
    /// # Errors
    ///
    /// Returns `ImportError::Parse` if a timestamp is malformed.
    pub fn into_record(self) -> Result<ProgramRecord, ImportError> {
        let start_time = parse_xmltv_time(&self.start).map_err(|e| {
            ImportError::Parse(format!("programme on channel {}: start {e}", self.channel))
        })?;
        let end_time = match self.stop.as_deref() {
            Some(stop) => parse_xmltv_time(stop).map_err(|e| {
                ImportError::Parse(format!("programme on channel {}: stop {e}", self.channel))
            })?,
            None => start_time,
        };

        let title = self.titles.into_iter().next();
        let description = self.descriptions.into_iter().next();

        let mut record = ProgramRecord::new(
            self.channel.trim(),
            start_time,
            end_time,
            title.as_ref().map_or_else(String::new, |t| t.text.trim().to_owned()),
        );
        record.title_language = title.and_then(|t| t.lang);
        record.description_language = description.as_ref().and_then(|d| d.lang.clone());
        record.description = description
            .map(|d| d.text.trim().to_owned())
            .filter(|d| !d.is_empty());
        record.rating = self
            .ratings
            .iter()
            .find_map(|r| r.value.as_deref().and_then(parse_rating));
        record.category_id = self
            .categories
            .iter()
            .find_map(|c| c.text.trim().parse::<u32>().ok());
        record.icon_ref = self.icon.map(|i| i.src).filter(|s| !s.is_empty());
        Ok(record)
    }
}

/// Parses an XMLTV timestamp into epoch seconds.
///
/// # Errors
///
/// Returns a description of the problem if `raw` matches neither form.
pub fn parse_xmltv_time(raw: &str) -> Result<i64, String> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_str(raw, TIME_FORMAT_WITH_OFFSET) {
        return Ok(dt.timestamp());
    }
    NaiveDateTime::parse_from_str(raw, TIME_FORMAT_UTC)
        .map(|dt| dt.and_utc().timestamp())
        .map_err(|e| format!("invalid XMLTV time {raw:?}: {e}"))
}

/// Extracts the numeric part of a rating value.
fn parse_rating(value: &str) -> Option<u32> {
    RATING_RE
        .captures(value)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Decodes an XMLTV document into a record stream.
///
/// The document structure is checked up front; each programme is converted
/// when the stream is consumed.
///
/// # Errors
///
/// Returns `ImportError::Parse` if the document is not well-formed XMLTV.
pub fn records_from_document(document: &str) -> Result<RecordStream, ImportError> {
    let tv: TvDocument = quick_xml::de::from_str(document).map_err(|e| {
        let preview = document
            .get(..document.floor_char_boundary(200))
            .unwrap_or_default();
        ImportError::Parse(format!(
            "XMLTV decoding failed (len={}): {e}; starts with {preview:?}",
            document.len()
        ))
    })?;
    tracing::debug!(programmes = tv.programmes.len(), "XMLTV document decoded");
    Ok(Box::new(
        tv.programmes.into_iter().map(XmlProgramme::into_record),
    ))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::indexing_slicing)]

    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE tv SYSTEM "xmltv.dtd">
<tv generator-info-name="test">
  <channel id="7"><display-name>Seven</display-name></channel>
  <programme start="20240101000000 +0000" stop="20240101003000 +0000" channel="7">
    <title lang="en">Morning News</title>
    <date>20240101</date>
    <title lang="fr">Nouvelles</title>
    <desc lang="en">Headlines &amp; weather</desc>
    <category lang="en">News</category>
    <category>12</category>
    <rating system="MPAA"><value>PG-13</value></rating>
    <icon src="http://example.com/news.png"/>
  </programme>
  <programme start="20240101093000 +0900" stop="20240101100000 +0900" channel=" 8 ">
    <title>Cartoons</title>
  </programme>
</tv>"#;

    fn collect(document: &str) -> Vec<ProgramRecord> {
        records_from_document(document)
            .unwrap()
            .map(Result::unwrap)
            .collect()
    }

    #[test]
    fn test_parse_xmltv_time_with_offset() {
        // Arrange & Act & Assert
        assert_eq!(parse_xmltv_time("20240101000000 +0000").unwrap(), 1_704_067_200);
        assert_eq!(parse_xmltv_time("20240101090000 +0900").unwrap(), 1_704_067_200);
        assert_eq!(parse_xmltv_time("20231231190000 -0500").unwrap(), 1_704_067_200);
    }

    #[test]
    fn test_parse_xmltv_time_without_offset_is_utc() {
        // Arrange & Act & Assert
        assert_eq!(parse_xmltv_time("20240101000000").unwrap(), 1_704_067_200);
    }

    #[test]
    fn test_parse_xmltv_time_rejects_garbage() {
        // Arrange & Act & Assert
        assert!(parse_xmltv_time("2024-01-01").is_err());
        assert!(parse_xmltv_time("").is_err());
    }

    #[test]
    fn test_document_to_records() {
        // Arrange & Act
        let records = collect(SAMPLE);

        // Assert
        assert_eq!(records.len(), 2);
        let news = &records[0];
        assert_eq!(news.channel_id, "7");
        assert_eq!(news.start_time, 1_704_067_200);
        assert_eq!(news.end_time, 1_704_069_000);
        assert_eq!(news.title, "Morning News");
        assert_eq!(news.title_language.as_deref(), Some("en"));
        assert_eq!(news.description.as_deref(), Some("Headlines & weather"));
        assert_eq!(news.description_language.as_deref(), Some("en"));
        assert_eq!(news.category_id, Some(12));
        assert_eq!(news.rating, Some(13));
        assert_eq!(news.icon_ref.as_deref(), Some("http://example.com/news.png"));

        let cartoons = &records[1];
        assert_eq!(cartoons.channel_id, "8");
        assert_eq!(cartoons.start_time, 1_704_069_000);
        assert_eq!(cartoons.description, None);
        assert_eq!(cartoons.rating, None);
    }

    #[test]
    fn test_missing_stop_yields_invalid_record() {
        // Arrange
        let doc = r#"<tv><programme start="20240101000000 +0000" channel="7"><title>Open end</title></programme></tv>"#;

        // Act
        let records = collect(doc);

        // Assert
        assert_eq!(records[0].start_time, records[0].end_time);
        assert!(records[0].validate().is_err());
    }

    #[test]
    fn test_bad_timestamp_fails_record() {
        // Arrange
        let doc = r#"<tv><programme start="yesterday" stop="20240101000000 +0000" channel="7"><title>X</title></programme></tv>"#;

        // Act
        let mut stream = records_from_document(doc).unwrap();

        // Assert
        assert!(matches!(stream.next(), Some(Err(ImportError::Parse(_)))));
    }

    #[test]
    fn test_malformed_document_is_parse_error() {
        // Arrange
        let doc = "<tv><programme start=\"20240101000000 +0000\"";

        // Act
        let result = records_from_document(doc);

        // Assert
        assert!(matches!(result, Err(ImportError::Parse(_))));
    }

    #[test]
    fn test_empty_tv_has_no_records() {
        // Arrange & Act
        let records = collect("<tv></tv>");

        // Assert
        assert!(records.is_empty());
    }

    #[test]
    fn test_parse_rating_digits() {
        // Arrange & Act & Assert
        assert_eq!(parse_rating("PG-13"), Some(13));
        assert_eq!(parse_rating("18"), Some(18));
        assert_eq!(parse_rating("TV-MA"), None);
    }
}
