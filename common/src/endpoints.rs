pub const AUTH_TOKEN_PATH: &str = "/auth/v1/token";
pub const GRANT_PASSWORD: &str = "password";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";
pub const REST_PATH: &str = "/rest/v1";

pub const HEADER_API_KEY: &str = "apikey";
pub const HEADER_AUTHORIZATION: &str = "Authorization";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_PREFER: &str = "Prefer";

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const PREFER_RETURN_MINIMAL: &str = "return=minimal";

pub const STATUS_TOKEN_OK: u16 = 200;
pub const STATUS_INSERT_CREATED: u16 = 201;

pub const TOPIC_PRESENCE_SEGMENT: &str = "presence";
