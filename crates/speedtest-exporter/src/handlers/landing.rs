use std::sync::Arc;

use axum::{extract::State, response::Html};

use crate::router::ExporterState;

pub async fn landing_page(State(state): State<Arc<ExporterState>>) -> Html<String> {
    Html(format!(
        "<html>
<head><title>Speedtest Exporter</title></head>
<body>
<h1>Speedtest Exporter</h1>
<p><a href='{}'>Metrics</a></p>
</body>
</html>
",
        state.metrics_path
    ))
}
