use axum::response::Html;

const INDEX_HTML: &str = include_str!("../../static/index.html");
const REPORTS_HTML: &str = include_str!("../../static/reports.html");

/// Live dashboard
pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

pub async fn reports() -> Html<&'static str> {
    Html(REPORTS_HTML)
}
