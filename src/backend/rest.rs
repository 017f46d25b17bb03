use crate::{
    backend::{
        AcceptBetCall,
        BetApi,
        CreateBetCall,
        DeleteBetCall,
        LedgerApi,
        MatchApi,
    },
    error::{
        Error,
        Result,
    },
    session::{
        Session,
        SessionStore,
    },
    types::{
        Balances,
        BetId,
        BetStatus,
        Competitors,
        MatchId,
        MatchRef,
        PickId,
        PointsTransaction,
        Side,
        StraightBet,
        UserId,
    },
};
use chrono::{
    DateTime,
    Utc,
};
use reqwest::{
    RequestBuilder,
    StatusCode,
};
use serde::{
    Deserialize,
    Serialize,
    de::DeserializeOwned,
};

const REST_PREFIX: &str = "/rest/v1";

/// PostgREST-style client for the hosted backend.
#[derive(Clone)]
pub struct RestBackend {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
    sessions: SessionStore,
}

impl RestBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        sessions: SessionStore,
    ) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url,
            api_key: api_key.into(),
            http,
            sessions,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Password sign-in against the auth endpoint. Does not touch the session store.
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session> {
        let url = format!("{}/auth/v1/token", self.base_url);
        let res = self
            .http
            .post(url)
            .query(&[("grant_type", "password")])
            .header("apikey", &self.api_key)
            .json(&PasswordGrant { email, password })
            .send()
            .await
            .map_err(|e| Error::transport(format!("auth request failed: {e}")))?;
        let bytes = check_response(res).await?;
        let dto: TokenDto = serde_json::from_slice(&bytes)
            .map_err(|e| Error::transport(format!("invalid auth payload: {e}")))?;
        let username = dto
            .user
            .user_metadata
            .and_then(|meta| meta.username)
            .or(dto.user.email)
            .unwrap_or_else(|| dto.user.id.clone());
        Ok(Session::new(dto.user.id, username, dto.access_token))
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        let token = self
            .sessions
            .current()
            .map(|session| session.access_token)
            .unwrap_or_else(|| self.api_key.clone());
        req.header("apikey", &self.api_key).bearer_auth(token)
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let url = format!("{}{}/{}", self.base_url, REST_PREFIX, table);
        let res = self
            .authorized(self.http.get(url))
            .query(&[("select", "*")])
            .query(query)
            .send()
            .await
            .map_err(|e| Error::transport(format!("{table} request failed: {e}")))?;
        let bytes = check_response(res).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::transport(format!("invalid {table} payload: {e}")))
    }

    async fn rpc(&self, name: &str, args: &impl Serialize) -> Result<Vec<u8>> {
        let url = format!("{}{}/rpc/{}", self.base_url, REST_PREFIX, name);
        tracing::debug!(rpc = name, "calling remote procedure");
        let res = self
            .authorized(self.http.post(url))
            .json(args)
            .send()
            .await
            .map_err(|e| Error::transport(format!("{name} request failed: {e}")))?;
        check_response(res).await
    }

    async fn bets(&self, query: Vec<(&str, String)>) -> Result<Vec<StraightBet>> {
        self.select("straight_bets", &query).await
    }
}

async fn check_response(res: reqwest::Response) -> Result<Vec<u8>> {
    let status = res.status();
    let bytes = res
        .bytes()
        .await
        .map_err(|e| Error::transport(format!("failed to read response body: {e}")))?;
    if status.is_success() {
        return Ok(bytes.to_vec());
    }
    Err(classify_failure(status, &bytes))
}

fn classify_failure(status: StatusCode, body: &[u8]) -> Error {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Error::Auth;
    }
    let gateway = matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    );
    let message = error_message(body);
    if status.is_server_error() {
        // Only a JSON error object comes from the database; anything else is the path to it.
        return match message {
            Some(message) if !gateway => Error::RemoteRejected(message),
            _ => Error::transport(format!("backend responded with {status}")),
        };
    }
    Error::RemoteRejected(message.unwrap_or_else(|| {
        let text = String::from_utf8_lossy(body).trim().to_string();
        if text.is_empty() {
            format!("Request failed with {status}")
        } else {
            text
        }
    }))
}

fn error_message(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<ErrorDto>(body)
        .ok()
        .and_then(|dto| dto.message.or(dto.msg).or(dto.error_description))
}

/// A procedure returning one row may answer with an object or a one-element array.
fn decode_single<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| Error::transport(format!("invalid procedure payload: {e}")))?;
    let row = match value {
        serde_json::Value::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
        serde_json::Value::Array(_) | serde_json::Value::Null => {
            return Err(Error::RemoteRejected(
                "Procedure returned no record".to_string(),
            ));
        }
        other => other,
    };
    serde_json::from_value(row)
        .map_err(|e| Error::transport(format!("invalid procedure payload: {e}")))
}

fn ordered(limit: usize) -> [(&'static str, String); 2] {
    [
        ("order", "created_at.desc".to_string()),
        ("limit", limit.to_string()),
    ]
}

impl LedgerApi for RestBackend {
    async fn balances(&self, user: &UserId) -> Result<Balances> {
        let rows: Vec<PointsRow> = self
            .select("user_points", &[("user_id", format!("eq.{user}"))])
            .await?;
        rows.into_iter()
            .next()
            .map(|row| Balances::new(row.free_points, row.reserved_points))
            .ok_or_else(|| Error::RemoteRejected(format!("No points account for {user}")))
    }

    async fn transactions(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<PointsTransaction>> {
        let mut query = vec![("user_id", format!("eq.{user}"))];
        query.extend(ordered(limit));
        self.select("points_transactions", &query).await
    }
}

impl BetApi for RestBackend {
    async fn bets_by_status(
        &self,
        status: BetStatus,
        limit: usize,
    ) -> Result<Vec<StraightBet>> {
        let mut query = vec![("status", format!("eq.{status}"))];
        query.extend(ordered(limit));
        self.bets(query).await
    }

    async fn bets_by_match(
        &self,
        match_id: &MatchId,
        limit: usize,
    ) -> Result<Vec<StraightBet>> {
        let mut query = vec![("match_id", format!("eq.{match_id}"))];
        query.extend(ordered(limit));
        self.bets(query).await
    }

    async fn bets_by_user(
        &self,
        user: &UserId,
        status: Option<BetStatus>,
        limit: usize,
    ) -> Result<Vec<StraightBet>> {
        let mut query = vec![(
            "or",
            format!("(creator_id.eq.{user},acceptor_id.eq.{user})"),
        )];
        if let Some(status) = status {
            query.push(("status", format!("eq.{status}")));
        }
        query.extend(ordered(limit));
        self.bets(query).await
    }

    async fn bet(&self, id: &BetId) -> Result<Option<StraightBet>> {
        let rows = self.bets(vec![("id", format!("eq.{id}"))]).await?;
        Ok(rows.into_iter().next())
    }

    async fn create_straight_bet(&self, call: CreateBetCall) -> Result<StraightBet> {
        let bytes = self.rpc("create_straight_bet_atomic", &call).await?;
        decode_single(&bytes)
    }

    async fn accept_straight_bet(&self, call: AcceptBetCall) -> Result<()> {
        self.rpc("accept_straight_bet_atomic", &call).await?;
        Ok(())
    }

    async fn delete_straight_bet(&self, call: DeleteBetCall) -> Result<()> {
        self.rpc("delete_straight_bet_atomic", &call).await?;
        Ok(())
    }
}

impl MatchApi for RestBackend {
    async fn match_ref(&self, id: &MatchId) -> Result<Option<MatchRef>> {
        let rows: Vec<MatchRow> = self
            .select("match_details", &[("id", format!("eq.{id}"))])
            .await?;
        Ok(rows.into_iter().next().map(Into::into))
    }

    async fn upcoming_matches(&self, limit: usize) -> Result<Vec<MatchRef>> {
        let rows: Vec<MatchRow> = self
            .select(
                "match_details",
                &[
                    ("starts_at", format!("gte.{}", Utc::now().to_rfc3339())),
                    ("order", "starts_at.asc".to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct TokenDto {
    access_token: String,
    user: AuthUserDto,
}

#[derive(Deserialize)]
struct AuthUserDto {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: Option<UserMetadataDto>,
}

#[derive(Deserialize)]
struct UserMetadataDto {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Deserialize)]
struct ErrorDto {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct PointsRow {
    free_points: u64,
    reserved_points: u64,
}

#[derive(Deserialize)]
struct MatchRow {
    id: MatchId,
    event_type: String,
    side_a_id: PickId,
    side_a_name: String,
    side_b_id: PickId,
    side_b_name: String,
    #[serde(default)]
    starts_at: Option<DateTime<Utc>>,
}

impl From<MatchRow> for MatchRef {
    fn from(row: MatchRow) -> Self {
        let competitors = if row.event_type.eq_ignore_ascii_case("player") {
            Competitors::Players
        } else {
            Competitors::Teams
        };
        MatchRef {
            id: row.id,
            competitors,
            side_a: Side {
                id: row.side_a_id,
                name: row.side_a_name,
            },
            side_b: Side {
                id: row.side_b_id,
                name: row.side_b_name,
            },
            starts_at: row.starts_at,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn classify_failure__maps_unauthorized_to_auth() {
        let err = classify_failure(StatusCode::UNAUTHORIZED, b"{\"message\":\"JWT expired\"}");
        assert_eq!(err, Error::Auth);
    }

    #[test]
    fn classify_failure__keeps_backend_message_verbatim() {
        // given
        let body = br#"{"code":"P0001","message":"Bet is not open","details":null}"#;

        // when
        let err = classify_failure(StatusCode::BAD_REQUEST, body);

        // then
        assert_eq!(err, Error::RemoteRejected("Bet is not open".to_string()));
    }

    #[test]
    fn classify_failure__empty_server_error_is_transport() {
        let err = classify_failure(StatusCode::BAD_GATEWAY, b"");
        assert!(err.is_retryable());
    }

    #[test]
    fn classify_failure__gateway_error_page_is_transport() {
        // given
        let page = b"<html><body><h1>502 Bad Gateway</h1></body></html>";

        // when
        let bad_gateway = classify_failure(StatusCode::BAD_GATEWAY, page);
        let unavailable = classify_failure(
            StatusCode::SERVICE_UNAVAILABLE,
            br#"{"message":"upstream connect error"}"#,
        );
        let timeout = classify_failure(StatusCode::GATEWAY_TIMEOUT, page);

        // then
        for err in [bad_gateway, unavailable, timeout] {
            assert!(matches!(&err, Error::Transport(detail) if !detail.contains("<html>")));
            assert!(err.is_retryable());
        }
    }

    #[test]
    fn classify_failure__server_error_with_database_message_is_rejection() {
        // given
        let json = br#"{"code":"P0001","message":"Insufficient points"}"#;

        // when
        let rejected = classify_failure(StatusCode::INTERNAL_SERVER_ERROR, json);
        let garbled = classify_failure(StatusCode::INTERNAL_SERVER_ERROR, b"Internal Server Error");

        // then
        assert_eq!(rejected, Error::RemoteRejected("Insufficient points".to_string()));
        assert!(garbled.is_retryable());
    }

    #[test]
    fn decode_single__accepts_object_or_array() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Row {
            id: String,
        }

        let from_object: Row = decode_single(br#"{"id":"b1"}"#).unwrap();
        let from_array: Row = decode_single(br#"[{"id":"b1"}]"#).unwrap();
        let empty = decode_single::<Row>(b"[]");

        assert_eq!(from_object, from_array);
        assert!(matches!(empty, Err(Error::RemoteRejected(_))));
    }

    #[test]
    fn match_row__player_events_map_to_players() {
        // given
        let json = r#"{
            "id": "m1",
            "event_type": "player",
            "side_a_id": "p1",
            "side_a_name": "Vex",
            "side_b_id": "p2",
            "side_b_name": "Nyra"
        }"#;

        // when
        let row: MatchRow = serde_json::from_str(json).unwrap();
        let match_ref = MatchRef::from(row);

        // then
        assert_eq!(match_ref.competitors, Competitors::Players);
        assert_eq!(match_ref.title(), "Vex vs Nyra");
    }

    #[test]
    fn create_call__serializes_rpc_argument_names() {
        // given
        let call = CreateBetCall {
            user_id: UserId::new("u1"),
            bet_id: BetId::new("b1"),
            match_id: MatchId::new("m1"),
            picks_id: PickId::new("p1"),
            amount: 100,
            note: None,
            event_id: crate::types::CorrelationId::fresh(),
        };

        // when
        let value = serde_json::to_value(&call).unwrap();

        // then
        for key in [
            "user_id", "bet_id", "match_id", "picks_id", "amount", "note", "event_id",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }
}
