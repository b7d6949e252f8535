//! JavaScript injected into the page by the stability detector.

use crate::config::StabilityConfig;

/// Installed before every document: publishes a mutation counter the
/// detector polls. The page-side timestamp is advisory only; the detector
/// re-verifies change timing with its own clock.
pub const MUTATION_WATCHER: &str = r#"
(() => {
    if (window.__harStability) return;
    const state = { mutations: 0, lastMutation: Date.now() };
    window.__harStability = state;
    const attach = () => {
        if (!document.documentElement) return;
        const observer = new MutationObserver(() => {
            state.mutations += 1;
            state.lastMutation = Date.now();
        });
        observer.observe(document.documentElement, {
            childList: true,
            subtree: true,
            attributes: true,
            characterData: true
        });
    };
    if (document.documentElement) attach();
    else document.addEventListener('DOMContentLoaded', attach);
})();
"#;

pub const MUTATION_COUNTER: &str =
    "window.__harStability ? window.__harStability.mutations : 0";

/// Builds the resource poll for the configured categories. Returns a JSON
/// string array naming every resource that is still pending.
pub fn resources_pending(config: &StabilityConfig) -> String {
    format!(
        r#"
(() => {{
    const pending = [];
    if ({images}) {{
        for (const img of document.images) {{
            if (!img.complete) pending.push('image:' + (img.currentSrc || img.src || '?'));
        }}
    }}
    if ({fonts}) {{
        if (document.fonts && document.fonts.status !== 'loaded') pending.push('fonts');
    }}
    if ({stylesheets}) {{
        for (const sheet of document.styleSheets) {{
            try {{ void sheet.cssRules; }} catch (e) {{
                pending.push('stylesheet:' + (sheet.href || '?'));
            }}
        }}
    }}
    if ({scripts}) {{
        if (document.readyState !== 'complete') pending.push('scripts');
    }}
    return JSON.stringify(pending);
}})()
"#,
        images = config.wait_for_images,
        fonts = config.wait_for_fonts,
        stylesheets = config.wait_for_stylesheets,
        scripts = config.wait_for_scripts,
    )
}

pub fn ready_state() -> &'static str {
    "document.readyState"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_poll_respects_config_flags() {
        let script = resources_pending(&StabilityConfig {
            wait_for_images: true,
            wait_for_fonts: false,
            wait_for_stylesheets: false,
            wait_for_scripts: false,
            ..Default::default()
        });
        assert!(script.contains("if (true) {\n        for (const img"));
        assert!(script.contains("if (false) {\n        if (document.fonts"));
    }
}
