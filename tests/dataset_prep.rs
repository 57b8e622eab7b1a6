use anyhow::Result;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

use mousedet_ops::dataset::merge::{collect, merge};
use mousedet_ops::dataset::{
    build_subset, devkit_lists, read_lines, write_devkit_lists, MergePlan, SourceSpec,
};
use mousedet_ops::voc;

fn annotation(filename: &str, label: &str) -> String {
    format!(
        "<annotation><folder>raw</folder><filename>{filename}</filename>\
         <path>/home/labeler/{filename}</path>\
         <size><width>320</width><height>240</height><depth>3</depth></size>\
         <object><name>{label}</name><difficult>0</difficult>\
         <bndbox><xmin>1</xmin><ymin>2</ymin><xmax>30</xmax><ymax>40</ymax></bndbox>\
         </object></annotation>"
    )
}

fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    Ok(())
}

#[test]
fn subset_links_sources_and_keeps_a_third() -> Result<()> {
    let dir = tempdir()?;
    let src = dir.path().join("dataset/mouse_other_voc");
    let dst = dir.path().join("dataset/mouse_other_voc_1of3");
    write(&src.join("images/a.jpg"), b"a")?;
    write(&src.join("annotations/a.xml"), annotation("a.jpg", "mouse").as_bytes())?;
    let train: String = (0..10)
        .map(|i| format!("./images/m{i}.jpg ./annotations/m{i}.xml\n"))
        .collect();
    write(&src.join("train.txt"), format!("{train}\n\n").as_bytes())?;
    write(&src.join("val.txt"), b"./images/v.jpg ./annotations/v.xml\n")?;
    write(&src.join("label_list.txt"), b"mouse\nother\n")?;

    let report = build_subset(&src, &dst, 3)?;
    assert_eq!(report.total, 10);
    assert_eq!(report.selected, 3);
    assert_eq!(report.val_lines, 1);

    let kept = read_lines(&dst.join("train.txt"))?;
    assert_eq!(kept.len(), 3);
    assert_eq!(kept[0], "./images/m0.jpg ./annotations/m0.xml");
    assert!(std::fs::symlink_metadata(dst.join("images"))?.file_type().is_symlink());
    assert_eq!(std::fs::read(dst.join("images/a.jpg"))?, b"a");
    assert_eq!(std::fs::read_to_string(dst.join("label_list.txt"))?, "mouse\nother\n");

    // Running again replaces the links instead of failing.
    build_subset(&src, &dst, 3)?;
    assert!(build_subset(&src, &dst, 0).is_err());
    Ok(())
}

#[test]
fn subset_requires_source_lists() -> Result<()> {
    let dir = tempdir()?;
    let err = build_subset(&dir.path().join("missing"), &dir.path().join("out"), 3).unwrap_err();
    assert!(err.to_string().contains("train.txt"));
    Ok(())
}

#[test]
fn merge_renumbers_relabels_and_splits() -> Result<()> {
    let dir = tempdir()?;
    let base = dir.path();
    let voc = base.join("dataset/dog_mouse_other_voc");
    for (name, label) in [
        ("mouse_1", "mouse"),
        ("mouse_2", "mouse"),
        ("other_1", "other"),
        ("dog_1", "dog"),
        ("dog_2", "dog"),
        ("mouse_3", "mouse"),
    ] {
        write(&voc.join(format!("images/{name}.jpg")), name.as_bytes())?;
        write(
            &voc.join(format!("annotations/{name}.xml")),
            annotation(&format!("{name}.jpg"), label).as_bytes(),
        )?;
    }
    // No annotation: skipped.
    write(&voc.join("images/mouse_9.jpg"), b"lonely")?;
    // Whiteboard captures keep annotations next to the images.
    write(&base.join("wb/mouse-wb.jpg"), b"wb")?;
    write(&base.join("wb/mouse-wb.xml"), annotation("mouse-wb.jpg", "Mouse").as_bytes())?;

    let source = |name: &str, images: &str, annotations: Option<&str>, pattern: &str, label: &str| {
        SourceSpec {
            name: name.to_string(),
            images: PathBuf::from(images),
            annotations: annotations.map(PathBuf::from),
            pattern: pattern.to_string(),
            label: label.to_string(),
        }
    };
    let plan = MergePlan {
        output: PathBuf::from("dataset/mouse_other_voc"),
        labels: vec!["mouse".to_string(), "other".to_string()],
        seed: 42,
        train_ratio: 0.8,
        sources: vec![
            source("dataset", "dataset/dog_mouse_other_voc/images", Some("dataset/dog_mouse_other_voc/annotations"), "mouse_*.jpg", "mouse"),
            source("dataset", "dataset/dog_mouse_other_voc/images", Some("dataset/dog_mouse_other_voc/annotations"), "other_*.jpg", "other"),
            source("dataset-dog", "dataset/dog_mouse_other_voc/images", Some("dataset/dog_mouse_other_voc/annotations"), "dog_*.jpg", "other"),
            source("wb-img", "wb", None, "mouse*.jpg", "mouse"),
            source("missing", "nowhere", None, "*.jpg", "other"),
        ],
    }
    .rooted_at(base);

    // Stale output is wiped.
    write(&base.join("dataset/mouse_other_voc/images/stale.jpg"), b"old")?;

    let collected = collect(&plan)?;
    assert_eq!(
        collected.iter().map(|c| c.pairs.len()).collect::<Vec<_>>(),
        vec![3, 1, 2, 1, 0]
    );
    let report = merge(&plan, &collected)?;

    let out = base.join("dataset/mouse_other_voc");
    assert_eq!(report.per_label["mouse"], 4);
    assert_eq!(report.per_label["other"], 3);
    assert_eq!(report.total(), 7);
    assert_eq!(report.train.len(), 5);
    assert_eq!(report.val.len(), 2);
    assert!(!out.join("images/stale.jpg").exists());

    // Mouse items are numbered in source order, the whiteboard image last.
    assert_eq!(std::fs::read(out.join("images/mouse_00001.jpg"))?, b"mouse_1");
    assert_eq!(std::fs::read(out.join("images/mouse_00004.jpg"))?, b"wb");
    assert_eq!(std::fs::read(out.join("images/other_00002.jpg"))?, b"dog_1");

    let dog = voc::parse_file(&out.join("annotations/other_00002.xml"))?;
    assert_eq!(dog.filename, "other_00002.jpg");
    assert_eq!(dog.objects[0].name, "other");
    let wb = voc::parse_file(&out.join("annotations/mouse_00004.xml"))?;
    assert_eq!(wb.objects[0].name, "mouse");
    let raw = std::fs::read_to_string(out.join("annotations/mouse_00004.xml"))?;
    assert!(raw.contains("<folder>images</folder>"));
    assert!(raw.contains("<path>mouse_00004.jpg</path>"));

    let train = read_lines(&out.join("train.txt"))?;
    let val = read_lines(&out.join("val.txt"))?;
    assert_eq!(train.len() + val.len(), 7);
    let mut sorted = train.clone();
    sorted.sort();
    assert_eq!(train, sorted);
    assert!(train.iter().all(|line| line.starts_with("./images/") && line.contains(" ./annotations/")));
    assert_eq!(std::fs::read_to_string(out.join("label_list.txt"))?, "mouse\nother\n");

    // Same seed, same split.
    let again = merge(&plan, &collected)?;
    assert_eq!(again.train, report.train);
    Ok(())
}

#[test]
fn devkit_lists_dedupe_and_require_files() -> Result<()> {
    let dir = tempdir()?;
    let devkit = dir.path();
    for id in ["a", "b", "c"] {
        write(&devkit.join(format!("images/{id}.jpg")), b"img")?;
        write(&devkit.join(format!("annotations/{id}.xml")), annotation(id, "mouse").as_bytes())?;
    }
    write(&devkit.join("ImageSets/Main/train.txt"), b"a\nb 1\n\n")?;
    write(&devkit.join("ImageSets/Main/val.txt"), b"b\nc\n")?;
    write(&devkit.join("ImageSets/Main/test.txt"), b"a\n")?;

    let lists = devkit_lists(devkit)?;
    assert_eq!(lists.train.len(), 2);
    assert_eq!(lists.val.len(), 1);
    assert!(lists.val[0].image.ends_with("images/c.jpg"));
    assert!(lists.val[0].annotation.ends_with("annotations/c.xml"));

    let out = devkit.join("lists");
    std::fs::create_dir_all(&out)?;
    let written = write_devkit_lists(devkit, &out, Some(7))?;
    assert_eq!(read_lines(&out.join("train.txt"))?.len(), written.train.len());
    assert_eq!(read_lines(&out.join("val.txt"))?.len(), 1);

    write(&devkit.join("ImageSets/Main/val.txt"), b"missing\n")?;
    let err = devkit_lists(devkit).unwrap_err();
    assert!(err.to_string().contains("not found"));
    Ok(())
}
