#[path = "../auth.rs"]
#[allow(dead_code)]
mod auth;

fn main() {
    let token = auth::generate_operator_token();
    println!("operator token (give to the console):  {token}");
    println!("ADMIN_TOKEN_SHA256={}", auth::hash_token(&token));
}
