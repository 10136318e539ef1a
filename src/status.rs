use std::sync::Arc;

use log::info;
use serde_json::json;
use warp::http::StatusCode;
use warp::Filter;

use crate::upstream::Upstream;
use crate::VERSION;

// Renders the /stats HTML table: aggregate and per-upstream byte
// rates, opened/closed/failed counts, and the healthy-upstream ratio.
// The page auto-refreshes every 5 seconds.
fn render_stats(upstreams: &[Arc<Upstream>]) -> String {
    let healthy = upstreams.iter().filter(|u| u.is_healthy()).count();

    let mut rows = String::new();
    for up in upstreams {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            up.endpoint,
            if up.is_healthy() { "healthy" } else { "unhealthy" },
            up.byte_rate.last_minute_count(),
            up.opened.total_count(),
            up.closed.total_count(),
            up.failed.total_count(),
        ));
    }

    format!(
        "<html><head><meta http-equiv=\"refresh\" content=\"5\"></head><body>\n\
         <h1>tcp-lb-proxy stats</h1>\n\
         <p>healthy upstreams: {healthy}/{total}</p>\n\
         <table border=\"1\">\n\
         <tr><th>upstream</th><th>status</th><th>bytes/min</th><th>opened</th><th>closed</th><th>failed</th></tr>\n\
         {rows}\
         </table>\n\
         </body></html>",
        healthy = healthy,
        total = upstreams.len(),
        rows = rows,
    )
}

fn healthy_upstream_count(upstreams: &[Arc<Upstream>]) -> usize {
    upstreams.iter().filter(|u| u.is_healthy()).count()
}

// Serves GET /stats and GET /admin on status_port until the process
// exits. A collaborator of the dispatcher, not part of it: it only
// needs Upstream::is_healthy and the rate counters already maintained
// for load balancing.
pub async fn serve(upstreams: Arc<Vec<Arc<Upstream>>>, port: u16) {
    let stats_upstreams = Arc::clone(&upstreams);
    let stats_route = warp::path("stats").map(move || {
        warp::reply::with_header(
            render_stats(&stats_upstreams),
            "content-type",
            "text/html",
        )
    });

    let admin_upstreams = Arc::clone(&upstreams);
    let admin_route = warp::path("admin").map(move || {
        let healthy = healthy_upstream_count(&admin_upstreams);
        let body = warp::reply::with_header(
            json!({ "version": VERSION }).to_string(),
            "content-type",
            "text/html",
        );
        let status = if healthy > 0 {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        warp::reply::with_status(body, status)
    });

    let routes = stats_route.or(admin_route);

    info!("status server listening on 0.0.0.0:{}", port);
    warp::serve(routes).run(([0, 0, 0, 0], port)).await;
}
