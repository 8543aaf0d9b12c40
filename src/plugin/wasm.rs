use wasmparser::{Parser, Payload};

/// Returns the distinct module names a WASM binary imports from, in
/// first-seen order.
pub fn imported_modules(bytes: &[u8]) -> Result<Vec<String>, String> {
    let mut modules: Vec<String> = Vec::new();

    for payload in Parser::new(0).parse_all(bytes) {
        let Payload::ImportSection(imports) = payload.map_err(|err| err.to_string())? else {
            continue;
        };
        for import in imports {
            let import = import.map_err(|err| err.to_string())?;
            if !modules.iter().any(|module| module == import.module) {
                modules.push(import.module.to_string());
            }
        }
    }

    Ok(modules)
}
