//! Built-in HTML pages.
//!
//! Pages are plain templates. Scripts and styles are served from `/assets/`.

const TOKEN_PLACEHOLDER: &str = "{{TOKEN}}";

pub const LOGIN_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Lobby - Sign in</title>
  <link rel="stylesheet" href="/assets/css/style.css">
</head>
<body>
  <h1>Sign in</h1>
  <form id="login-form" method="post" action="/login">
    <label>Username <input id="username" name="username" required></label>
    <label>Password <input name="password" type="password" required></label>
    <button type="submit">Sign in</button>
  </form>
  <p>No account? <a href="/register">Register</a></p>
  <script src="/assets/js/app.js"></script>
</body>
</html>
"#;

const REGISTER_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Lobby - Register</title>
  <link rel="stylesheet" href="/assets/css/style.css">
</head>
<body>
  <h1>Create an account</h1>
  <form method="post" action="/register">
    <input type="hidden" name="reg_token" value="{{TOKEN}}">
    <label>Username <input name="username" required></label>
    <label>Password <input name="password" type="password" minlength="6" required></label>
    <button type="submit">Register</button>
  </form>
  <p>Already registered? <a href="/login">Sign in</a></p>
</body>
</html>
"#;

pub const LOBBY_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Lobby</title>
  <link rel="stylesheet" href="/assets/css/style.css">
</head>
<body>
  <header>
    <span id="me"></span>
    <a href="/board">Board</a>
    <form method="post" action="/logout"><button type="submit">Log out</button></form>
  </header>
  <section id="online"></section>
  <section id="messages"></section>
  <form id="chat-form">
    <input id="message" autocomplete="off">
    <button type="submit">Send</button>
  </form>
  <script src="/assets/js/app.js"></script>
</body>
</html>
"#;

pub const BOARD_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Lobby - Board</title>
  <link rel="stylesheet" href="/assets/css/style.css">
</head>
<body>
  <p>Turn: <span id="turn"></span></p>
  <table id="board"></table>
  <a href="/lobby">Back to lobby</a>
  <script src="/assets/js/board.js"></script>
</body>
</html>
"#;

/// The registration page with `token` embedded in the form.
pub fn register_page(token: &str) -> String {
    REGISTER_TEMPLATE.replace(TOKEN_PLACEHOLDER, token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_page_embeds_token() {
        let page = register_page("abc123");
        assert!(page.contains(r#"name="reg_token" value="abc123""#));
        assert!(!page.contains(TOKEN_PLACEHOLDER));
    }
}
