use actix_web::{dev::Payload, web, Error, FromRequest, HttpRequest};
use actix_web_httpauth::extractors::bearer::BearerAuth;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::future::{ready, Ready};

/// Identity issued by the external sign-in provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Username at sign-in.
    pub name: String,
    pub exp: usize,
}

/// HS256 secret shared with the token issuer, stored as app data.
#[derive(Clone)]
pub struct JwtKeys {
    secret: String,
}

impl JwtKeys {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    pub fn decode(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let data = decode::<Claims>(token, &DecodingKey::from_secret(self.secret.as_bytes()), &validation)?;
        Ok(data.claims)
    }

    /// Issue a token valid for 24 hours.
    pub fn issue(&self, user_id: &str, username: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let exp = (chrono::Utc::now() + chrono::Duration::hours(24)).timestamp() as usize;
        let claims = Claims { sub: user_id.to_string(), name: username.to_string(), exp };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(self.secret.as_bytes()))
    }
}

/// Extractor yielding validated `Claims`.
pub struct Auth(pub Claims);

impl Auth {
    pub fn user_id(&self) -> &str { &self.0.sub }
}

impl FromRequest for Auth {
    type Error = Error;
    type Future = Ready<Result<Self, Error>>;

    fn from_request(req: &HttpRequest, pl: &mut Payload) -> Self::Future {
        let Some(keys) = req.app_data::<web::Data<JwtKeys>>() else {
            return ready(Err(actix_web::error::ErrorInternalServerError("JWT keys not configured")));
        };
        if let Ok(bearer) = BearerAuth::from_request(req, pl).into_inner() {
            return ready(match keys.decode(bearer.token()) {
                Ok(claims) => Ok(Auth(claims)),
                Err(_) => Err(actix_web::error::ErrorUnauthorized("Invalid JWT")),
            });
        }
        ready(Err(actix_web::error::ErrorUnauthorized("Authorization required")))
    }
}
