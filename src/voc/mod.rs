//! Pascal VOC annotation files.
//!
//! Parsing follows what the PaddleDetection VOC reader needs: the image file
//! name, the image size and every object's class name, `difficult` flag and
//! pixel box. Rewriting streams the original document through untouched except
//! for the handful of elements the dataset tools rename.

use anyhow::{anyhow, Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VocSize {
    pub width: i64,
    pub height: i64,
    pub depth: i64,
}

impl Default for VocSize {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            depth: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BndBox {
    pub xmin: i64,
    pub ymin: i64,
    pub xmax: i64,
    pub ymax: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VocObject {
    pub name: String,
    pub difficult: i64,
    /// Serialized as `{}` when the object carries no `<bndbox>`.
    #[serde(with = "bbox_or_empty")]
    pub bbox: Option<BndBox>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VocAnnotation {
    pub filename: String,
    pub size: VocSize,
    pub objects: Vec<VocObject>,
}

impl VocAnnotation {
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.objects.iter().map(|obj| obj.name.as_str())
    }
}

pub fn parse_file(path: &Path) -> Result<VocAnnotation> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read annotation {}", path.display()))?;
    parse_str(&raw).with_context(|| format!("invalid annotation {}", path.display()))
}

#[derive(Default)]
struct PartialBox {
    xmin: Option<i64>,
    ymin: Option<i64>,
    xmax: Option<i64>,
    ymax: Option<i64>,
}

impl PartialBox {
    fn finish(self) -> Result<BndBox> {
        let field = |value: Option<i64>, name: &str| {
            value.ok_or_else(|| anyhow!("bndbox is missing <{}>", name))
        };
        Ok(BndBox {
            xmin: field(self.xmin, "xmin")?,
            ymin: field(self.ymin, "ymin")?,
            xmax: field(self.xmax, "xmax")?,
            ymax: field(self.ymax, "ymax")?,
        })
    }
}

pub fn parse_str(xml: &str) -> Result<VocAnnotation> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut out = VocAnnotation::default();
    // Element names from the root down; the root itself is stack[0].
    let mut stack: Vec<String> = Vec::new();
    let mut object: Option<VocObject> = None;
    let mut bndbox: Option<PartialBox> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = element_name(&e);
                match (stack.len(), name.as_str()) {
                    (1, "object") => object = Some(VocObject::default()),
                    (2, "bndbox") if object.is_some() && stack[1] == "object" => {
                        bndbox = Some(PartialBox::default())
                    }
                    _ => {}
                }
                stack.push(name);
            }
            Event::Empty(e) => {
                // `<object/>` still counts as an (empty) object.
                if stack.len() == 1 && element_name(&e) == "object" {
                    out.objects.push(VocObject::default());
                }
            }
            Event::Text(t) => {
                let text = t.unescape()?;
                let path: Vec<&str> = stack.iter().skip(1).map(String::as_str).collect();
                match path.as_slice() {
                    ["filename"] => out.filename = text.into_owned(),
                    ["size", "width"] => out.size.width = parse_int(&text)?,
                    ["size", "height"] => out.size.height = parse_int(&text)?,
                    ["size", "depth"] => out.size.depth = parse_int(&text)?,
                    ["object", "name"] => {
                        if let Some(obj) = object.as_mut() {
                            obj.name = text.into_owned();
                        }
                    }
                    ["object", "difficult"] => {
                        if let Some(obj) = object.as_mut() {
                            obj.difficult = parse_int(&text)?;
                        }
                    }
                    ["object", "bndbox", coord] => {
                        if let Some(b) = bndbox.as_mut() {
                            let value = Some(parse_coord(&text)?);
                            match *coord {
                                "xmin" => b.xmin = value,
                                "ymin" => b.ymin = value,
                                "xmax" => b.xmax = value,
                                "ymax" => b.ymax = value,
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::End(_) => {
                let closed = stack.pop();
                match (stack.len(), closed.as_deref()) {
                    (2, Some("bndbox")) => {
                        if let (Some(obj), Some(b)) = (object.as_mut(), bndbox.take()) {
                            obj.bbox = Some(b.finish()?);
                        }
                    }
                    (1, Some("object")) => {
                        if let Some(obj) = object.take() {
                            out.objects.push(obj);
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if stack.is_empty() {
        Ok(out)
    } else {
        Err(anyhow!("unexpected end of document inside <{}>", stack.join("/")))
    }
}

/// Replacement values for [`rewrite`].
#[derive(Clone, Copy, Debug)]
pub struct Rewrite<'a> {
    /// New image file name, written to `<filename>` and `<path>`.
    pub filename: &'a str,
    /// New class name for every object, when relabelling.
    pub label: Option<&'a str>,
}

const IMAGES_FOLDER: &str = "images";

/// Rewrites file name, folder, path and (optionally) object names.
pub fn rewrite(xml: &str, rewrite: &Rewrite<'_>) -> Result<Vec<u8>> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    writer.get_mut().push(b'\n');

    let mut stack: Vec<String> = Vec::new();
    // Depth of the element whose children are being replaced.
    let mut replacing: Option<usize> = None;
    let mut seen_root = false;

    loop {
        let event = reader.read_event()?;
        if let Some(depth) = replacing {
            match event {
                Event::Start(ref e) => stack.push(element_name(e)),
                Event::End(e) => {
                    let closes_target = stack.len() == depth;
                    stack.pop();
                    if closes_target {
                        replacing = None;
                        writer.write_event(Event::End(e))?;
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            continue;
        }

        match event {
            Event::Decl(_) => {}
            Event::Text(t) if !seen_root => {
                if !t.unescape()?.trim().is_empty() {
                    writer.write_event(Event::Text(t))?;
                }
            }
            Event::Start(e) => {
                seen_root = true;
                stack.push(element_name(&e));
                match replacement_for(&stack, rewrite) {
                    Some(text) => {
                        writer.write_event(Event::Start(e))?;
                        writer.write_event(Event::Text(BytesText::new(text)))?;
                        replacing = Some(stack.len());
                    }
                    None => writer.write_event(Event::Start(e))?,
                }
            }
            Event::Empty(e) => {
                seen_root = true;
                let name = element_name(&e);
                stack.push(name.clone());
                let text = replacement_for(&stack, rewrite);
                stack.pop();
                match text {
                    Some(text) => {
                        writer.write_event(Event::Start(BytesStart::new(name.as_str())))?;
                        writer.write_event(Event::Text(BytesText::new(text)))?;
                        writer.write_event(Event::End(BytesEnd::new(name.as_str())))?;
                    }
                    None => writer.write_event(Event::Empty(e))?,
                }
            }
            Event::End(e) => {
                stack.pop();
                writer.write_event(Event::End(e))?;
            }
            Event::Eof => break,
            other => writer.write_event(other)?,
        }
    }

    Ok(writer.into_inner())
}

pub fn rewrite_file(src: &Path, dst: &Path, rw: &Rewrite<'_>) -> Result<()> {
    let raw = std::fs::read_to_string(src)
        .with_context(|| format!("failed to read annotation {}", src.display()))?;
    let out = rewrite(&raw, rw).with_context(|| format!("failed to rewrite {}", src.display()))?;
    std::fs::write(dst, out).with_context(|| format!("failed to write {}", dst.display()))?;
    Ok(())
}

/// Counts objects per class name.
pub fn label_counts<'a>(
    annotations: impl IntoIterator<Item = &'a VocAnnotation>,
) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for ann in annotations {
        for label in ann.labels() {
            *counts.entry(label.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

fn replacement_for<'a>(stack: &[String], rw: &Rewrite<'a>) -> Option<&'a str> {
    let path: Vec<&str> = stack.iter().skip(1).map(String::as_str).collect();
    match path.as_slice() {
        ["filename"] | ["path"] => Some(rw.filename),
        ["folder"] => Some(IMAGES_FOLDER),
        ["object", "name"] => rw.label,
        _ => None,
    }
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn parse_int(text: &str) -> Result<i64> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(0);
    }
    text.parse::<i64>()
        .or_else(|_| parse_coord(text))
        .map_err(|_| anyhow!("expected an integer, found '{}'", text))
}

fn parse_coord(text: &str) -> Result<i64> {
    let value: f64 = text
        .trim()
        .parse()
        .map_err(|_| anyhow!("expected a number, found '{}'", text.trim()))?;
    Ok(value.trunc() as i64)
}

mod bbox_or_empty {
    use super::BndBox;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Empty {}

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Box(BndBox),
        Empty(Empty),
    }

    pub fn serialize<S: Serializer>(value: &Option<BndBox>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bbox) => bbox.serialize(s),
            None => Empty {}.serialize(s),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<BndBox>, D::Error> {
        Ok(match Repr::deserialize(d)? {
            Repr::Box(bbox) => Some(bbox),
            Repr::Empty(_) => None,
        })
    }
}
