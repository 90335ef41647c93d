//! Config text for site files rewritten by migrations.
//!
//! The files live under `templates/` and are compiled into the binary. Only
//! the files the bundled migrations regenerate are rendered here.

use crate::site::{Site, SiteType};
use anyhow::{Context as _, Result};
use tera::{Context, Tera};

/// Marker line identifying the current nginx security include
pub const NGINX_SECURITY_MARKER: &str = "# ee-security-headers v2";

/// Default PHP version for sites that do not pin one
pub const DEFAULT_PHP_VERSION: &str = "7.4";

const SITE_COMPOSE: &str = "docker-compose.yml";
const NGINX_MAIN_CONF: &str = "nginx-main.conf";

/// Site templates registered by name
pub struct TemplateEngine {
    tera: Tera,
}

impl TemplateEngine {
    pub fn new() -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (SITE_COMPOSE, include_str!("../templates/docker-compose.yml.tera")),
            (NGINX_MAIN_CONF, include_str!("../templates/nginx-main.conf.tera")),
        ])
        .context("Failed to register site templates")?;
        // Config files, not HTML
        tera.autoescape_on(vec![]);
        Ok(Self { tera })
    }

    pub fn render_with_context(&self, name: &str, context: &Context) -> Result<String> {
        self.tera
            .render(name, context)
            .with_context(|| format!("Failed to render template {}", name))
    }
}

fn site_context(site: &Site) -> Context {
    let mut context = Context::new();
    context.insert("url", &site.url);
    context.insert("project", &site.project_name());
    context.insert("runs_php", &site.site_type.runs_php());
    context
}

/// Render a site's docker-compose.yml.
///
/// `php_conf_volume` mounts an external volume over the PHP config directory.
pub fn render_site_compose(site: &Site, php_conf_volume: Option<&str>) -> Result<String> {
    let php_image = site.site_type.runs_php().then(|| {
        let php = site.php_version.as_deref().unwrap_or(DEFAULT_PHP_VERSION);
        match site.site_type {
            SiteType::Wp => format!("easyengine/php{}", php),
            _ => format!("easyengine/php{}-fpm", php),
        }
    });

    let mut context = site_context(site);
    context.insert("php_image", &php_image);
    context.insert("php_conf_volume", &php_conf_volume);

    TemplateEngine::new()?.render_with_context(SITE_COMPOSE, &context)
}

/// Render the site's nginx main.conf with the current security headers
pub fn render_nginx_conf(site: &Site) -> Result<String> {
    let mut context = site_context(site);
    context.insert("marker", NGINX_SECURITY_MARKER);

    TemplateEngine::new()?.render_with_context(NGINX_MAIN_CONF, &context)
}
