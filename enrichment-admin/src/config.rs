use envconfig::Envconfig;

use enrichment_common::config::CommonConfig;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "ADMIN_BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "ADMIN_BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub common: CommonConfig,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
