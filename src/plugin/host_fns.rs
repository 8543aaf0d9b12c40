use extism::{CurrentPlugin, Function, PTR, UserData, Val};

use crate::plugin::manifest::PluginId;

/// Host functions every plugin module can import from `extism:host/user`.
pub fn functions(plugin_id: &PluginId) -> Vec<Function> {
    let id = plugin_id.clone();

    vec![Function::new(
        "host_log",
        [PTR, PTR],
        [],
        UserData::new(()),
        move |plugin: &mut CurrentPlugin, inputs: &[Val], _outputs: &mut [Val], _: UserData<()>| {
            let level: String = plugin.memory_get_val(arg(inputs, 0)?)?;
            let message: String = plugin.memory_get_val(arg(inputs, 1)?)?;
            log_from_plugin(&id, &level, &message);
            Ok(())
        },
    )]
}

fn arg(inputs: &[Val], index: usize) -> Result<&Val, extism::Error> {
    inputs
        .get(index)
        .ok_or_else(|| extism::Error::msg(format!("host_log: missing argument {index}")))
}

fn log_from_plugin(plugin: &PluginId, level: &str, message: &str) {
    match level.to_ascii_lowercase().as_str() {
        "error" => tracing::error!(plugin = %plugin, "{message}"),
        "warn" | "warning" => tracing::warn!(plugin = %plugin, "{message}"),
        "debug" => tracing::debug!(plugin = %plugin, "{message}"),
        "trace" => tracing::trace!(plugin = %plugin, "{message}"),
        _ => tracing::info!(plugin = %plugin, "{message}"),
    }
}
