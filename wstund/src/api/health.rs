/// Liveness probe; the fixed body is what monitoring scripts grep for.
pub(super) async fn health_check() -> &'static str {
    "WSTUNSRV RUNNING\n"
}
