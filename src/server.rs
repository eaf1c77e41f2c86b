use crate::artifacts::{self, Artifacts};
use anyhow::Context;
use axum::Router;
use std::fs;
use std::path::{Path, PathBuf};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub fn app(frontend_dir: &Path) -> Router {
    Router::new()
        .fallback_service(ServeDir::new(frontend_dir))
        .layer(TraceLayer::new_for_http())
}

/// Copies `viz_data.json` next to the frontend. Returns `None` when the
/// pipeline has not produced it yet.
pub fn stage_viz_data(out: &Artifacts, frontend_dir: &Path) -> anyhow::Result<Option<PathBuf>> {
    let src = out.path(artifacts::VIZ_DATA);
    if !src.exists() {
        return Ok(None);
    }

    fs::create_dir_all(frontend_dir)
        .with_context(|| format!("Failed to create {}", frontend_dir.display()))?;
    let dst = frontend_dir.join(artifacts::VIZ_DATA);
    info!("Copying {} to {}...", src.display(), dst.display());
    fs::copy(&src, &dst)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
    Ok(Some(dst))
}

pub async fn serve(
    out: &Artifacts,
    frontend_dir: &Path,
    host: &str,
    port: u16,
    open_browser: bool,
) -> anyhow::Result<()> {
    if stage_viz_data(out, frontend_dir)?.is_none() {
        error!("{} not found", out.path(artifacts::VIZ_DATA).display());
        error!("Run the pipeline first to generate visualization data");
        return Ok(());
    }

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let url = format!("http://localhost:{}", port);
    info!("Serving at {}", url);
    info!("Press Ctrl+C to stop");

    if open_browser {
        // Headless machines have no browser to launch
        if let Err(e) = open::that(&url) {
            warn!("Could not open browser: {}", e);
        }
    }

    axum::serve(listener, app(frontend_dir))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
        })
        .await
        .context("Server error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    #[test]
    fn test_stage_missing_viz_data() {
        let tmp = TempDir::new().unwrap();
        let out = Artifacts::new(tmp.path().join("output"));
        let staged = stage_viz_data(&out, &tmp.path().join("frontend")).unwrap();
        assert!(staged.is_none());
    }

    #[tokio::test]
    async fn test_serves_staged_viz_data() {
        let tmp = TempDir::new().unwrap();
        let out = Artifacts::new(tmp.path().join("output"));
        out.ensure_dir().unwrap();
        fs::write(out.path(artifacts::VIZ_DATA), r#"[{"id":"1"}]"#).unwrap();

        let frontend = tmp.path().join("frontend");
        fs::create_dir_all(&frontend).unwrap();
        fs::write(frontend.join("index.html"), "<html>atlas</html>").unwrap();

        let staged = stage_viz_data(&out, &frontend).unwrap();
        assert_eq!(staged, Some(frontend.join(artifacts::VIZ_DATA)));

        let response = app(&frontend)
            .oneshot(
                Request::builder()
                    .uri("/viz_data.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"[{"id":"1"}]"#);

        let response = app(&frontend)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app(&frontend)
            .oneshot(Request::builder().uri("/nope.js").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
