// Zip part access and small quick-xml helpers shared by the xlsx reader

use std::borrow::Cow;
use std::io::{BufReader, Read, Seek};

use quick_xml::events::{BytesRef, BytesStart, Event};
use quick_xml::Reader;
use sheetstream_engine::{CellRange, ExcelError, Result};
use zip::result::ZipError;
use zip::ZipArchive;

pub(crate) trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

pub(crate) type Archive = ZipArchive<Box<dyn ReadSeek>>;

pub(crate) type PartReader<'a> = Reader<BufReader<Box<dyn Read + 'a>>>;

pub(crate) fn zip_error(e: ZipError) -> ExcelError {
    match e {
        ZipError::Io(io) => ExcelError::Io(io),
        other => ExcelError::fatal(format!("zip: {}", other)),
    }
}

/// Actual entry name for `path`, matched case-insensitively.
fn entry_name(zip: &Archive, path: &str) -> Option<String> {
    let path = path.trim_start_matches('/');
    zip.file_names()
        .find(|n| n.eq_ignore_ascii_case(path))
        .map(str::to_owned)
}

pub(crate) fn has_part(zip: &Archive, path: &str) -> bool {
    entry_name(zip, path).is_some()
}

pub(crate) fn part_size(zip: &mut Archive, path: &str) -> Option<u64> {
    let name = entry_name(zip, path)?;
    zip.by_name(&name).ok().map(|f| f.size())
}

/// Whole part as text, `None` when the archive lacks it.
pub(crate) fn read_part(zip: &mut Archive, path: &str) -> Result<Option<String>> {
    let Some(name) = entry_name(zip, path) else {
        return Ok(None);
    };
    let mut file = zip.by_name(&name).map_err(zip_error)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

/// Streaming reader over one part.
pub(crate) fn open_part<'a>(zip: &'a mut Archive, path: &str) -> Result<Option<PartReader<'a>>> {
    let Some(name) = entry_name(zip, path) else {
        return Ok(None);
    };
    let file = zip.by_name(&name).map_err(zip_error)?;
    let boxed: Box<dyn Read + 'a> = Box::new(file);
    let mut reader = Reader::from_reader(BufReader::new(boxed));
    configure(&mut reader);
    Ok(Some(reader))
}

pub(crate) fn str_reader(xml: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(xml);
    configure(&mut reader);
    reader
}

fn configure<R>(reader: &mut Reader<R>) {
    let config = reader.config_mut();
    config.trim_text(false);
    config.expand_empty_elements = true;
    config.check_end_names = false;
}

/// Attribute value by local name (`r:id` matches `id`), unescaped.
pub(crate) fn attr(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.local_name().as_ref() != key {
            return None;
        }
        let unescaped = std::str::from_utf8(&a.value)
            .ok()
            .and_then(|s| quick_xml::escape::unescape(s).ok());
        match unescaped.ok_or(()) {
            Ok(v) => Some(v.into_owned()),
            Err(_) => Some(String::from_utf8_lossy(&a.value).into_owned()),
        }
    })
}

/// Text of a character or entity reference such as `&amp;` or `&#10;`.
pub(crate) fn resolve_ref(r: &BytesRef) -> Cow<'static, str> {
    if let Ok(Some(ch)) = r.resolve_char_ref() {
        return Cow::Owned(ch.to_string());
    }
    let name = String::from_utf8_lossy(r.as_ref()).into_owned();
    match quick_xml::escape::resolve_xml_entity(&name) {
        Some(s) => Cow::Borrowed(s),
        None => Cow::Owned(format!("&{};", name)),
    }
}

/// Append the text content of `event` to `out`; false for non-text events.
pub(crate) fn push_text(out: &mut String, event: &Event) -> bool {
    match event {
        Event::Text(t) => out.push_str(&String::from_utf8_lossy(t.as_ref())),
        Event::CData(c) => out.push_str(&String::from_utf8_lossy(c.as_ref())),
        Event::GeneralRef(r) => out.push_str(&resolve_ref(r)),
        _ => return false,
    }
    true
}

/// Parse a cell reference like "R104" or "AA1" to zero-based (row, col).
pub(crate) fn parse_cell_ref(cell_ref: &str) -> Option<(usize, usize)> {
    let mut col: usize = 0;
    let mut letters = 0;
    let mut row_part = String::new();

    for ch in cell_ref.chars() {
        if ch == '$' {
            continue;
        }
        if ch.is_ascii_alphabetic() && row_part.is_empty() {
            col = col * 26 + (ch.to_ascii_uppercase() as usize - 'A' as usize + 1);
            letters += 1;
        } else if ch.is_ascii_digit() {
            row_part.push(ch);
        } else {
            return None;
        }
    }

    if letters == 0 || row_part.is_empty() {
        return None;
    }
    let row = row_part.parse::<usize>().ok()?.checked_sub(1)?;
    Some((row, col - 1))
}

/// "A1:C3" or a single "B2".
pub(crate) fn parse_range_ref(range: &str) -> Option<CellRange> {
    match range.split_once(':') {
        None => parse_cell_ref(range).map(|(r, c)| CellRange::single(r, c)),
        Some((start, end)) => {
            let (r1, c1) = parse_cell_ref(start)?;
            let (r2, c2) = parse_cell_ref(end)?;
            Some(CellRange::new(r1.min(r2), r1.max(r2), c1.min(c2), c1.max(c2)))
        }
    }
}

pub(crate) fn column_letters(col: usize) -> String {
    let mut n = col + 1;
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Relationship {
    pub id: String,
    pub target: String,
    /// Last segment of the relationship type URI, e.g. `worksheet`
    pub kind: String,
    pub external: bool,
}

pub(crate) fn parse_relationships(xml: &str) -> Vec<Relationship> {
    let mut rels = Vec::new();
    let mut reader = str_reader(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) if e.local_name().as_ref() == b"Relationship" => {
                let (Some(id), Some(target)) = (attr(e, b"Id"), attr(e, b"Target")) else {
                    continue;
                };
                let kind = attr(e, b"Type")
                    .and_then(|t| t.rsplit('/').next().map(str::to_owned))
                    .unwrap_or_default();
                let external = attr(e, b"TargetMode").is_some_and(|m| m.eq_ignore_ascii_case("External"));
                rels.push(Relationship {
                    id,
                    target,
                    kind,
                    external,
                });
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::warn!(error = %e, "relationships part unreadable");
                break;
            }
            _ => {}
        }
    }
    rels
}

/// Resolve a relationship target against the folder of the part that owns it.
pub(crate) fn resolve_target(base_dir: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let mut parts: Vec<&str> = base_dir.split('/').filter(|p| !p.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

/// `xl/worksheets/sheet1.xml` → `xl/worksheets/_rels/sheet1.xml.rels`
pub(crate) fn rels_path(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((dir, file)) => format!("{}/_rels/{}.rels", dir, file),
        None => format!("_rels/{}.rels", part),
    }
}

pub(crate) fn parent_dir(part: &str) -> &str {
    part.rsplit_once('/').map_or("", |(dir, _)| dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cell_ref() {
        assert_eq!(parse_cell_ref("A1"), Some((0, 0)));
        assert_eq!(parse_cell_ref("R104"), Some((103, 17)));
        assert_eq!(parse_cell_ref("AA1"), Some((0, 26)));
        assert_eq!(parse_cell_ref("$B$3"), Some((2, 1)));
        assert_eq!(parse_cell_ref("A0"), None);
        assert_eq!(parse_cell_ref("12"), None);
    }

    #[test]
    fn test_column_letters_round_trip() {
        for col in [0, 25, 26, 701, 702, 16383] {
            let r = format!("{}7", column_letters(col));
            assert_eq!(parse_cell_ref(&r), Some((6, col)));
        }
    }

    #[test]
    fn test_parse_range_ref() {
        assert_eq!(parse_range_ref("B2:A1"), Some(CellRange::new(0, 1, 0, 1)));
        assert_eq!(parse_range_ref("C4"), Some(CellRange::single(3, 2)));
        assert_eq!(parse_range_ref("nope"), None);
    }

    #[test]
    fn test_resolve_target() {
        assert_eq!(resolve_target("xl", "worksheets/sheet1.xml"), "xl/worksheets/sheet1.xml");
        assert_eq!(resolve_target("xl/worksheets", "../comments1.xml"), "xl/comments1.xml");
        assert_eq!(resolve_target("xl", "/xl/worksheets/s.xml"), "xl/worksheets/s.xml");
        assert_eq!(rels_path("xl/worksheets/sheet2.xml"), "xl/worksheets/_rels/sheet2.xml.rels");
    }

    #[test]
    fn test_parse_relationships() {
        let xml = r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
            <Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/>
            <Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/hyperlink" Target="https://example.com/?a=1&amp;b=2" TargetMode="External"/>
        </Relationships>"#;
        let rels = parse_relationships(xml);
        assert_eq!(rels.len(), 2);
        assert_eq!(rels[0].kind, "worksheet");
        assert!(!rels[0].external);
        assert_eq!(rels[1].target, "https://example.com/?a=1&b=2");
        assert!(rels[1].external);
    }

    #[test]
    fn test_push_text_resolves_entities() {
        let mut reader = str_reader("<t>a &amp; b&#33;</t>");
        let mut out = String::new();
        loop {
            match reader.read_event().unwrap() {
                Event::Eof => break,
                e => {
                    push_text(&mut out, &e);
                }
            }
        }
        assert_eq!(out, "a & b!");
    }
}
