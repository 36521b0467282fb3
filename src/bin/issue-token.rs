/// Mint a bearer token for a staff account.
///
/// Usage: issue-token --user-id ID --role ROLE [--ttl SECONDS]
///   Signs with JWT_SECRET.

use clap::Parser;

use ecole_api::{middleware::auth::encode_access_token, models::user::UserRole};

#[derive(Parser)]
#[command(name = "issue-token", about = "Issue an access token for the school API")]
struct Args {
    #[arg(long)]
    user_id: i64,

    /// admin, directeur, secretaire, comptable or enseignant
    #[arg(long)]
    role: UserRole,

    /// Token lifetime in seconds
    #[arg(long, default_value_t = 8 * 3600)]
    ttl: u64,

    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    secret: String,
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let token = encode_access_token(args.user_id, args.role, &args.secret, args.ttl)?;
    println!("{token}");
    Ok(())
}
