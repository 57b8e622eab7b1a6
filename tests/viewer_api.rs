use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::tempdir;

use mousedet_ops::config::Workspace;
use mousedet_ops::viewer::{self, ViewerConfig, ViewerHandle};

const ANNOTATION: &str = r#"<annotation>
    <folder>images</folder>
    <filename>mouse_00001.jpg</filename>
    <size><width>640</width><height>480</height><depth>3</depth></size>
    <object>
        <name>mouse</name>
        <difficult>0</difficult>
        <bndbox><xmin>10.6</xmin><ymin>20</ymin><xmax>110</xmax><ymax>220</ymax></bndbox>
    </object>
</annotation>"#;

// Stands in for tools/infer.py when run through /bin/sh.
const FAKE_INFER: &str = r#"echo "loading $2"
out=""
while [ $# -gt 0 ]; do
    if [ "$1" = "--output_dir" ]; then out="$2"; fi
    shift
done
mkdir -p "$out"
printf 'jpegbytes' > "$out/mouse_00001.jpg"
echo "inference done" >&2
"#;

const SLOW_INFER: &str = "sleep 1\necho slow done\n";

fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    Ok(())
}

struct Response {
    headers: String,
    body: Vec<u8>,
}

impl Response {
    fn json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

fn send(addr: std::net::SocketAddr, request: &[u8]) -> Result<Response> {
    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(request)?;
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(raw.len());
    Ok(Response {
        headers: String::from_utf8_lossy(&raw[..split]).into_owned(),
        body: raw.get(split + 4..).unwrap_or_default().to_vec(),
    })
}

fn get(addr: std::net::SocketAddr, path: &str) -> Result<Response> {
    send(
        addr,
        format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes(),
    )
}

fn post(addr: std::net::SocketAddr, path: &str, body: &[u8]) -> Result<Response> {
    let mut request = format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(body);
    send(addr, &request)
}

struct TestViewer {
    dir: tempfile::TempDir,
    handle: Option<ViewerHandle>,
}

impl TestViewer {
    fn new() -> Result<Self> {
        Self::with_infer("/bin/sh", FAKE_INFER)
    }

    fn with_infer(python: &str, infer_script: &str) -> Result<Self> {
        let dir = tempdir()?;
        let root = dir.path();
        let ds = root.join("dataset/mouse_other_voc");
        write(&ds.join("images/mouse_00001.jpg"), b"fakejpg")?;
        write(&ds.join("images/other_00001.png"), b"fakepng")?;
        write(&ds.join("annotations/mouse_00001.xml"), ANNOTATION.as_bytes())?;
        write(&root.join("dataset/empty/readme.txt"), b"not a dataset")?;
        write(&root.join("output/L1_picodet_1gpu/best_model.pdparams"), b"w")?;
        write(&root.join("configs/picodet/picodet_s_320_coco_lcnet.yml"), b"")?;
        write(&root.join("configs/picodet/_base_/optimizer_300e.yml"), b"")?;
        write(&root.join("tools/infer.py"), infer_script.as_bytes())?;

        let handle = viewer::spawn(ViewerConfig {
            addr: "127.0.0.1:0".to_string(),
            workspace: Workspace::new(root),
            python: python.to_string(),
        })?;
        Ok(Self {
            dir,
            handle: Some(handle),
        })
    }

    fn addr(&self) -> std::net::SocketAddr {
        self.handle
            .as_ref()
            .expect("viewer handle should be initialized")
            .addr
    }
}

impl Drop for TestViewer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop().expect("failed to stop viewer");
        }
    }
}

fn wait_for_job(addr: std::net::SocketAddr) -> Result<Value> {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let status = get(addr, "/api/infer/status")?.json()?;
        if status["running"] == false {
            return Ok(status);
        }
        assert!(Instant::now() < deadline, "inference did not finish");
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn lists_datasets_and_scans() -> Result<()> {
    let viewer = TestViewer::new()?;

    let response = get(viewer.addr(), "/api/datasets")?;
    assert!(response.headers.contains("200 OK"));
    assert!(response.headers.contains("Access-Control-Allow-Origin: *"));
    let datasets = response.json()?;
    assert_eq!(datasets["datasets"].as_array().map(Vec::len), Some(1));
    assert_eq!(datasets["datasets"][0]["name"], "mouse_other_voc");
    assert_eq!(datasets["datasets"][0]["image_count"], 2);

    let scan = get(viewer.addr(), "/api/scan?path=mouse_other_voc")?.json()?;
    assert_eq!(scan["total_images"], 2);
    assert_eq!(scan["annotated"], 1);
    assert_eq!(scan["labels"]["mouse"], 1);
    assert_eq!(scan["items"][0]["annotation"], "mouse_00001.xml");
    assert!(scan["items"][1]["annotation"].is_null());

    let missing = get(viewer.addr(), "/api/scan")?.json()?;
    assert!(missing.get("error").is_some());
    let unknown = get(viewer.addr(), "/api/scan?path=nope")?.json()?;
    assert!(unknown.get("error").is_some());
    let no_images = get(viewer.addr(), "/api/scan?path=empty")?.json()?;
    assert!(no_images.get("error").is_some());
    assert_eq!(no_images["items"], Value::Array(Vec::new()));
    Ok(())
}

#[test]
fn serves_annotations_and_images() -> Result<()> {
    let viewer = TestViewer::new()?;

    let ann = get(
        viewer.addr(),
        "/api/annotation?dataset=mouse_other_voc&file=mouse_00001.xml",
    )?
    .json()?;
    assert_eq!(ann["filename"], "mouse_00001.jpg");
    assert_eq!(ann["size"]["width"], 640);
    assert_eq!(ann["objects"][0]["name"], "mouse");
    assert_eq!(ann["objects"][0]["bbox"]["xmin"], 10);

    let image = get(viewer.addr(), "/images/mouse_00001.jpg?dataset=mouse_other_voc")?;
    assert!(image.headers.contains("200 OK"));
    assert!(image.headers.contains("Content-Type: image/jpeg"));
    assert!(image.headers.contains("Cache-Control: no-cache"));
    assert_eq!(image.body, b"fakejpg");

    let index = get(viewer.addr(), "/")?;
    assert!(index.headers.contains("text/html"));
    assert!(String::from_utf8_lossy(&index.body).contains("<html"));

    assert!(get(viewer.addr(), "/images/nope.jpg?dataset=mouse_other_voc")?
        .headers
        .contains("404"));
    assert!(get(viewer.addr(), "/nothing-here")?.headers.contains("404"));
    Ok(())
}

#[test]
fn refuses_path_traversal() -> Result<()> {
    let viewer = TestViewer::new()?;
    write(&viewer.dir.path().join("secret.txt"), b"top secret")?;

    let escaped = get(
        viewer.addr(),
        "/images/..%2F..%2F..%2Fsecret.txt?dataset=mouse_other_voc",
    )?;
    assert!(escaped.headers.contains("404"));
    let escaped = get(viewer.addr(), "/images/secret.txt?dataset=../..")?;
    assert!(escaped.headers.contains("404"));

    let ann = get(viewer.addr(), "/api/annotation?dataset=..&file=secret.txt")?.json()?;
    assert!(ann.get("error").is_some());
    Ok(())
}

#[test]
fn lists_models_and_configs() -> Result<()> {
    let viewer = TestViewer::new()?;

    let models = get(viewer.addr(), "/api/models")?.json()?;
    assert_eq!(
        models["models"][0]["path"],
        "output/L1_picodet_1gpu/best_model.pdparams"
    );

    let configs = get(viewer.addr(), "/api/configs")?.json()?;
    let paths: Vec<&str> = configs["configs"]
        .as_array()
        .map(|items| items.iter().filter_map(|c| c["path"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(paths, vec!["configs/picodet/picodet_s_320_coco_lcnet.yml"]);

    let slims = get(viewer.addr(), "/api/slim_configs")?.json()?;
    assert_eq!(slims["slim_configs"][0]["path"], "");
    assert_eq!(slims["slim_configs"].as_array().map(Vec::len), Some(1));
    Ok(())
}

#[test]
fn upload_keeps_only_the_file_name() -> Result<()> {
    let viewer = TestViewer::new()?;

    let saved = post(viewer.addr(), "/api/upload?filename=..%2F..%2Fcam.jpg", b"pixels")?.json()?;
    assert_eq!(saved["filename"], "cam.jpg");
    let path = saved["path"].as_str().unwrap_or_default().to_string();
    assert!(path.ends_with("_web_uploads/cam.jpg"));
    assert_eq!(std::fs::read(&path)?, b"pixels");

    let default = post(viewer.addr(), "/api/upload", b"x")?.json()?;
    assert_eq!(default["filename"], "upload.jpg");
    Ok(())
}

#[test]
fn runs_inference_job() -> Result<()> {
    let viewer = TestViewer::new()?;

    let idle = get(viewer.addr(), "/api/infer/status")?.json()?;
    assert_eq!(idle["running"], false);
    assert!(get(viewer.addr(), "/api/infer/result_image")?
        .headers
        .contains("404"));

    let bad = post(viewer.addr(), "/api/infer/run", b"{not json")?.json()?;
    assert_eq!(bad["error"], "Invalid JSON");

    let params = serde_json::json!({
        "config": "configs/picodet/picodet_s_320_coco_lcnet.yml",
        "weights": "output/L1_picodet_1gpu/best_model.pdparams",
        "infer_img": "dataset/mouse_other_voc/images/mouse_00001.jpg",
        "draw_threshold": 0.5,
    });
    let started = post(viewer.addr(), "/api/infer/run", params.to_string().as_bytes())?.json()?;
    assert_eq!(started["status"], "started");

    let status = wait_for_job(viewer.addr())?;

    assert_eq!(status["exit_code"], 0);
    let log = status["log"].as_str().unwrap_or_default();
    assert!(log.starts_with("Starting inference...\n"));
    assert!(log.contains("CMD: /bin/sh tools/infer.py -c configs/picodet/picodet_s_320_coco_lcnet.yml"));
    assert!(log.contains("--draw_threshold 0.5"));
    assert!(log.contains("loading configs/picodet/picodet_s_320_coco_lcnet.yml"));
    assert!(log.contains("inference done"));
    assert!(log.contains("[Exit code: 0]"));
    assert!(status["result_image"]
        .as_str()
        .unwrap_or_default()
        .ends_with("mouse_00001.jpg"));

    let image = get(viewer.addr(), "/api/infer/result_image")?;
    assert!(image.headers.contains("200 OK"));
    assert!(image.headers.contains("Cache-Control: no-store"));
    assert_eq!(image.body, b"jpegbytes");

    let vis = get(viewer.addr(), "/infer_vis/mouse_00001.jpg")?;
    assert_eq!(vis.body, b"jpegbytes");
    Ok(())
}

#[test]
fn second_run_is_refused_while_busy() -> Result<()> {
    let viewer = TestViewer::with_infer("/bin/sh", SLOW_INFER)?;
    let params = serde_json::json!({ "config": "configs/picodet/picodet_s_320_coco_lcnet.yml" });

    let first = post(viewer.addr(), "/api/infer/run", params.to_string().as_bytes())?.json()?;
    assert_eq!(first["status"], "started");
    let busy = get(viewer.addr(), "/api/infer/status")?.json()?;
    assert_eq!(busy["running"], true);

    let second = post(viewer.addr(), "/api/infer/run", params.to_string().as_bytes())?.json()?;
    assert!(second["error"]
        .as_str()
        .unwrap_or_default()
        .contains("already running"));

    let status = wait_for_job(viewer.addr())?;
    assert_eq!(status["exit_code"], 0);
    assert!(status["log"].as_str().unwrap_or_default().contains("slow done"));
    // Only the first job wrote to the log.
    assert_eq!(
        status["log"].as_str().unwrap_or_default().matches("CMD:").count(),
        1
    );
    Ok(())
}

#[test]
fn previous_results_are_cleared_before_a_run() -> Result<()> {
    let viewer = TestViewer::new()?;
    let vis = viewer.dir.path().join("output/_web_infer_vis");
    write(&vis.join("old.jpg"), b"stale")?;
    write(&vis.join("old_result.json"), b"{}")?;

    let params = serde_json::json!({ "config": "configs/picodet/picodet_s_320_coco_lcnet.yml" });
    let started = post(viewer.addr(), "/api/infer/run", params.to_string().as_bytes())?.json()?;
    assert_eq!(started["status"], "started");
    let status = wait_for_job(viewer.addr())?;

    assert_eq!(status["exit_code"], 0);
    assert!(!vis.join("old.jpg").exists());
    assert!(!vis.join("old_result.json").exists());
    assert!(status["result_image"]
        .as_str()
        .unwrap_or_default()
        .ends_with("_web_infer_vis/mouse_00001.jpg"));
    Ok(())
}

#[test]
fn unstartable_interpreter_is_reported() -> Result<()> {
    let viewer = TestViewer::with_infer("/nonexistent/python", FAKE_INFER)?;
    let params = serde_json::json!({ "config": "configs/picodet/picodet_s_320_coco_lcnet.yml" });

    let started = post(viewer.addr(), "/api/infer/run", params.to_string().as_bytes())?.json()?;
    assert_eq!(started["status"], "started");
    let status = wait_for_job(viewer.addr())?;

    assert_eq!(status["running"], false);
    assert_eq!(status["exit_code"], -1);
    assert!(status["result_image"].is_null());
    assert!(status["log"]
        .as_str()
        .unwrap_or_default()
        .contains("[ERROR] failed to start /nonexistent/python"));
    Ok(())
}

#[test]
fn missing_config_fails_and_frees_the_job() -> Result<()> {
    let viewer = TestViewer::new()?;

    let started = post(viewer.addr(), "/api/infer/run", b"{}")?.json()?;
    assert_eq!(started["status"], "started");
    let status = wait_for_job(viewer.addr())?;
    assert_eq!(status["exit_code"], -1);
    assert!(status["log"]
        .as_str()
        .unwrap_or_default()
        .contains("[ERROR] config is required"));

    // The failed request does not block the next one.
    let params = serde_json::json!({ "config": "configs/picodet/picodet_s_320_coco_lcnet.yml" });
    let retry = post(viewer.addr(), "/api/infer/run", params.to_string().as_bytes())?.json()?;
    assert_eq!(retry["status"], "started");
    assert_eq!(wait_for_job(viewer.addr())?["exit_code"], 0);
    Ok(())
}
