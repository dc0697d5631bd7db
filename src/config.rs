//! Loading `AgentConfig`/`BenchmarkConfig` from a file whose format (TOML
//! or JSON) is sniffed rather than fixed by extension, so the same schema
//! can be authored either way.

use serde::de::DeserializeOwned;
use tokio::fs;

use crate::prelude::*;

/// Read and parse a config file, trying JSON first and falling back to
/// TOML. Both formats describe the same schema, so whichever parses
/// cleanly wins; a file that is neither reports the JSON error, since
/// that's the more common format for machine-generated configs.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let body = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config file {}", path.display()))?;

    match serde_json::from_str::<T>(&body) {
        Ok(value) => Ok(value),
        Err(json_err) => toml::from_str::<T>(&body).map_err(|toml_err| {
            anyhow!(
                "failed to parse {} as JSON ({json_err}) or TOML ({toml_err})",
                path.display()
            )
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"name": "a", "count": 3}"#).await.unwrap();
        let parsed: Sample = read_json_or_toml(&path).await.unwrap();
        assert_eq!(parsed, Sample { name: "a".to_owned(), count: 3 });
    }

    #[tokio::test]
    async fn reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "name = \"b\"\ncount = 5\n").await.unwrap();
        let parsed: Sample = read_json_or_toml(&path).await.unwrap();
        assert_eq!(parsed, Sample { name: "b".to_owned(), count: 5 });
    }
}
