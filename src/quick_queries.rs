//! Quick queries
//!
//! Canned analytics for the `sales(order_id, date, customer_id, product_category,
//! revenue)` demo schema. They run through the same read-only [`Executor`] as generated
//! candidates. The SQL is SQLite flavoured (`strftime`, `DATE(x, '-14 days')`).

use crate::execution::{ExecutionResult, Executor};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuickQuery {
    pub name: &'static str,
    pub title: &'static str,
    pub sql: &'static str,
}

pub const QUICK_QUERIES: &[QuickQuery] = &[
    QuickQuery {
        name: "revenue_by_month",
        title: "Revenue by month",
        sql: "SELECT strftime('%Y-%m', date) AS year_month, SUM(revenue) AS total_revenue
FROM sales
GROUP BY year_month
ORDER BY year_month",
    },
    QuickQuery {
        name: "top5_customers",
        title: "Top 5 customers by revenue",
        sql: "SELECT customer_id, SUM(revenue) AS total_revenue
FROM sales
GROUP BY customer_id
ORDER BY total_revenue DESC
LIMIT 5",
    },
    QuickQuery {
        name: "category_contribution",
        title: "Revenue by product category",
        sql: "SELECT product_category, SUM(revenue) AS category_revenue
FROM sales
GROUP BY product_category
ORDER BY category_revenue DESC",
    },
    QuickQuery {
        name: "aov",
        title: "Average order value",
        sql: "SELECT ROUND(AVG(revenue), 2) AS average_order_value
FROM sales",
    },
    QuickQuery {
        name: "repeat_customers",
        title: "Customers with two or more orders",
        sql: "WITH counts AS (
  SELECT customer_id, COUNT(*) AS num_orders
  FROM sales
  GROUP BY customer_id
)
SELECT COUNT(*) AS repeat_customers
FROM counts
WHERE num_orders >= 2",
    },
    QuickQuery {
        name: "revenue_by_week",
        title: "Revenue by week",
        sql: "SELECT strftime('%Y-%W', date) AS year_week, SUM(revenue) AS total_revenue
FROM sales
GROUP BY year_week
ORDER BY year_week",
    },
    QuickQuery {
        name: "last_14_days",
        title: "Daily revenue, last 14 days",
        sql: "WITH max_day AS (
  SELECT DATE(MAX(date)) AS max_date FROM sales
)
SELECT DATE(date) AS day, SUM(revenue) AS total_revenue
FROM sales, max_day
WHERE DATE(date) > DATE(max_day.max_date, '-14 days')
GROUP BY day
ORDER BY day",
    },
    QuickQuery {
        name: "avg_rev_per_customer_2024",
        title: "Average revenue per customer (2024)",
        sql: "SELECT ROUND(SUM(revenue) * 1.0 / COUNT(DISTINCT customer_id), 2) AS avg_rev_per_customer
FROM sales
WHERE strftime('%Y', date) = '2024'",
    },
    QuickQuery {
        name: "best_aov_category",
        title: "Category with the best average order value",
        sql: "SELECT product_category, ROUND(AVG(revenue), 2) AS avg_order_value
FROM sales
GROUP BY product_category
ORDER BY avg_order_value DESC
LIMIT 1",
    },
];

/// Look up a canned query by name (case-insensitive, `-` and `_` interchangeable).
pub fn find(name: &str) -> Option<&'static QuickQuery> {
    let wanted = name.trim().to_lowercase().replace('-', "_");
    QUICK_QUERIES.iter().find(|q| q.name == wanted)
}

pub async fn run(executor: &Executor, query: &QuickQuery) -> ExecutionResult {
    info!("Running quick query '{}'", query.name);
    executor.execute_sql(query.sql).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{check_read_only, SqlDialect};

    #[test]
    fn test_lookup() {
        assert_eq!(find("top5-customers").map(|q| q.name), Some("top5_customers"));
        assert_eq!(find(" AOV ").map(|q| q.name), Some("aov"));
        assert!(find("profit_by_region").is_none());
    }

    #[test]
    fn test_every_quick_query_passes_the_guard() {
        assert_eq!(QUICK_QUERIES.len(), 9);
        for query in QUICK_QUERIES {
            assert!(
                check_read_only(query.sql, SqlDialect::Sqlite).is_ok(),
                "{} rejected",
                query.name
            );
        }
    }
}
