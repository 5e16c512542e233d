pub(crate) fn metric_name(name: &str) -> String {
    format!("p47_network_controller_{}", name)
}
