use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

pub const MISSING_CREDENTIALS_MESSAGE: &str =
    "No se encontraron las credenciales de Kaggle en Key Vault.";

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Falta la variable de entorno: {0}")]
    MissingSetting(&'static str),

    #[error("{}", MISSING_CREDENTIALS_MESSAGE)]
    MissingCredentials,

    #[error("Secret store error: {0:#}")]
    SecretStore(anyhow::Error),

    #[error("Dataset error: {0:#}")]
    Dataset(anyhow::Error),

    #[error("Storage error: {0:#}")]
    Storage(anyhow::Error),

    #[error("Scratch directory error: {0}")]
    Scratch(#[from] std::io::Error),
}

impl AppError {
    /// Stable identifier of the failure class, returned to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::MissingSetting(_) => "missing_setting",
            AppError::MissingCredentials => "missing_credentials",
            AppError::SecretStore(_) => "secret_store",
            AppError::Dataset(_) => "dataset",
            AppError::Storage(_) => "storage",
            AppError::Scratch(_) => "scratch",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MissingSetting(_) | AppError::MissingCredentials => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the caller. Server-side failures get a fixed text per
    /// kind; the detail only goes to the log.
    pub fn public_message(&self) -> String {
        match self {
            AppError::MissingSetting(_) | AppError::MissingCredentials => self.to_string(),
            AppError::SecretStore(_) => "Error: no se pudieron leer los secretos de Key Vault.".to_string(),
            AppError::Dataset(_) => "Error: no se pudo descargar el dataset.".to_string(),
            AppError::Storage(_) => "Error: no se pudo subir al contenedor de almacenamiento.".to_string(),
            AppError::Scratch(_) => "Error: no se pudo preparar el directorio temporal.".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            AppError::SecretStore(e) | AppError::Dataset(e) | AppError::Storage(e) => {
                tracing::error!(kind = self.kind(), "Ingestion failed: {:?}", e);
            }
            AppError::Scratch(e) => {
                tracing::error!(kind = self.kind(), "Scratch directory failure: {:?}", e);
            }
            AppError::MissingSetting(_) | AppError::MissingCredentials => {
                tracing::warn!(kind = self.kind(), "Rejected: {}", self);
            }
        }

        let body = Json(json!({
            "error": self.public_message(),
            "kind": self.kind(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use serde_json::Value;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::MissingSetting("KEY_VAULT_URI").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::MissingCredentials.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::Dataset(anyhow::anyhow!("403 Forbidden")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::Scratch(std::io::Error::other("disk full")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_missing_setting_names_key() {
        assert_eq!(
            AppError::MissingSetting("CONTAINER_NAME").public_message(),
            "Falta la variable de entorno: CONTAINER_NAME"
        );
    }

    #[tokio::test]
    async fn test_server_error_body_hides_detail() {
        let err = AppError::Storage(anyhow::anyhow!("AuthorizationFailure: token for tenant abc"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["kind"], "storage");
        assert!(!json["error"].as_str().unwrap().contains("tenant"));
    }
}
